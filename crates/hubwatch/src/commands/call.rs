//! `call`: issue one command and report acceptance and verification.

use serde_json::{Map, Value};

use hubwatch_core::{DeviceCommand, Dispatch, ExecutionReport, ExpectedState, Hub};

use crate::cli::{CallArgs, GlobalOpts};
use crate::error::CliError;
use crate::output;

use super::{expected_state, split_service};

pub async fn handle(hub: &Hub, args: CallArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let command = build_command(&args)?;
    let report = hub.execute(command, args.wait, args.timeout).await?;

    let color = output::should_color(global.color);
    let rendered = output::render_single(
        global.output,
        &report,
        |r| detail(r, color),
        |r| r.operation.id.to_string(),
    );
    output::print_output(&rendered, global.quiet);

    // Without --wait only a rejection is an error; a pending operation is
    // the expected outcome.
    let settled = args.wait || matches!(report.dispatch, Dispatch::Rejected { .. });
    if settled {
        report.into_verified()?;
    }
    Ok(())
}

fn build_command(args: &CallArgs) -> Result<DeviceCommand, CliError> {
    let (domain, service) = split_service(&args.service)?;
    let state = expected_state(domain, service, args.expect.as_deref())?;

    let expect = args
        .attrs
        .iter()
        .fold(ExpectedState::new(state), |expect, (key, value)| {
            expect.with_attribute(key.clone(), value.clone())
        });

    let mut command = DeviceCommand::new(domain, service, args.entity.clone(), expect);
    for (key, value) in &args.data {
        command = command.with_data(key.clone(), value.clone());
    }
    if let Some(timeout) = args.timeout {
        command = command.with_timeout(timeout);
    }
    Ok(command)
}

fn describe(state: &str, attributes: &Map<String, Value>) -> String {
    if attributes.is_empty() {
        state.to_owned()
    } else {
        format!("{state} {}", Value::Object(attributes.clone()))
    }
}

fn detail(report: &ExecutionReport, color: bool) -> String {
    let op = &report.operation;
    let mut pairs = vec![
        ("Operation", op.id.to_string()),
        ("Entity", op.target_id.clone()),
        ("Dispatch", report.dispatch.label().to_owned()),
        ("Status", output::status_label(op.status, color)),
        (
            "Expected",
            describe(&op.expected_state.state, &op.expected_state.attributes),
        ),
    ];
    if let Some(ref observed) = op.result {
        pairs.push(("Observed", describe(&observed.state, &observed.attributes)));
    }
    pairs.push(("Deadline", op.timeout_at.to_rfc3339()));
    if let Some(done) = op.completed_at {
        let took = (done - op.created_at).to_std().unwrap_or_default();
        pairs.push(("Settled after", humantime::format_duration(took).to_string()));
    }
    if let Some(reason) = report.dispatch.detail().or_else(|| op.error.clone()) {
        pairs.push(("Detail", reason));
    }
    output::detail_lines(&pairs)
}
