//! `status`: connect and report what the supervisor sees.

use serde::Serialize;

use hubwatch_core::{ConnectionState, Hub, OperationStats};

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

#[derive(Debug, Serialize)]
struct StatusView {
    url: String,
    state: ConnectionState,
    hub_version: Option<String>,
    retry_count: u32,
    uptime: Option<String>,
    last_error: Option<String>,
    operations: OperationStats,
}

pub async fn handle(hub: &Hub, global: &GlobalOpts) -> Result<(), CliError> {
    let status = hub.status().await;
    let view = StatusView {
        url: hub.config().url.to_string(),
        state: status.state,
        hub_version: status.hub_version,
        retry_count: status.retry_count,
        uptime: status
            .uptime
            .map(|d| humantime::format_duration(std::time::Duration::from_secs(d.as_secs())).to_string()),
        last_error: status.last_error,
        operations: status.operations,
    };

    let rendered = output::render_single(global.output, &view, detail, |v| v.state.to_string());
    output::print_output(&rendered, global.quiet);
    Ok(())
}

fn detail(view: &StatusView) -> String {
    let ops = &view.operations;
    output::detail_lines(&[
        ("Hub", view.url.clone()),
        ("State", view.state.to_string()),
        ("Version", view.hub_version.clone().unwrap_or_else(|| "-".into())),
        ("Uptime", view.uptime.clone().unwrap_or_else(|| "-".into())),
        ("Retries", view.retry_count.to_string()),
        ("Last error", view.last_error.clone().unwrap_or_else(|| "-".into())),
        (
            "Operations",
            format!(
                "{} pending, {} completed, {} failed, {} timed out",
                ops.pending, ops.completed, ops.failed, ops.timed_out
            ),
        ),
    ])
}
