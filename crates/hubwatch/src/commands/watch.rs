//! `watch`: stream hub events until interrupted.
//!
//! The event feed ends with its connection; the supervisor reconnects and
//! the feed is opened again.

use owo_colors::OwoColorize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use hubwatch_core::{ConnectionState, Hub, HubEvent};

use crate::cli::{GlobalOpts, OutputFormat, WatchArgs};
use crate::error::CliError;
use crate::output;

pub async fn handle(hub: &Hub, args: WatchArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let event_type = (!args.all).then_some(args.event_type.as_str());
    let color = output::should_color(global.color);
    let mut states = hub.connection_state();
    let mut seen = 0_usize;

    loop {
        let mut events = hub.events(event_type).await?;
        states.mark_unchanged();
        info!(event_type = ?event_type, "watching events");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => return Ok(()),
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if !wanted(&event, &args.entities) {
                        continue;
                    }
                    output::print_output(&render(&event, global.output, color), global.quiet);
                    seen += 1;
                    if args.count.is_some_and(|n| seen >= n) {
                        return Ok(());
                    }
                }
            }
        }

        warn!("event feed interrupted, waiting for the hub to reconnect");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            back = reconnected(&mut states) => {
                if !back {
                    return Err(CliError::Disconnected);
                }
            }
        }
    }
}

/// Wait for the next `Connected`; `false` once reconnecting has stopped.
async fn reconnected(states: &mut watch::Receiver<ConnectionState>) -> bool {
    loop {
        if states.changed().await.is_err() {
            return false;
        }
        match *states.borrow_and_update() {
            ConnectionState::Connected => return true,
            ConnectionState::Failed | ConnectionState::Disconnected => return false,
            _ => {}
        }
    }
}

fn entity_of(event: &HubEvent) -> Option<&str> {
    event.data.get("entity_id").and_then(Value::as_str)
}

fn wanted(event: &HubEvent, entities: &[String]) -> bool {
    entities.is_empty() || entity_of(event).is_some_and(|id| entities.iter().any(|e| e == id))
}

fn render(event: &HubEvent, format: OutputFormat, color: bool) -> String {
    let change = event.state_change();
    match format {
        OutputFormat::Json | OutputFormat::JsonCompact => output::render_json_line(event),
        OutputFormat::Yaml => output::render_single(format, event, |_| String::new(), |_| String::new()),
        OutputFormat::Plain => match change {
            Some(c) => format!("{} {}", c.target_id, c.new_state),
            None => event.event_type.clone(),
        },
        OutputFormat::Table => {
            let time = chrono::Local::now().format("%H:%M:%S").to_string();
            let time = if color { time.dimmed().to_string() } else { time };
            match change {
                Some(c) => {
                    let state = if color { c.new_state.bold().to_string() } else { c.new_state };
                    if c.attributes.is_empty() {
                        format!("{time}  {}  {state}", c.target_id)
                    } else {
                        format!("{time}  {}  {state}  {}", c.target_id, Value::Object(c.attributes))
                    }
                }
                None => format!("{time}  {}  {}", event.event_type, event.data),
            }
        }
    }
}
