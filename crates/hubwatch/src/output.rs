//! Rendering for `--output`.
//!
//! `json`, `json-compact` and `yaml` always serialize the full value through
//! serde. `table` and `plain` are human views chosen by each command.

use std::io::{self, IsTerminal, Write};

use owo_colors::OwoColorize;
use serde::Serialize;
use tabled::{Table, Tabled, settings::Style};

use hubwatch_core::OperationStatus;

use crate::cli::{ColorMode, OutputFormat};

pub fn should_color(mode: ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => std::env::var_os("NO_COLOR").is_none() && io::stdout().is_terminal(),
    }
}

/// Operation status, green/yellow/red by outcome when `color` is set.
pub fn status_label(status: OperationStatus, color: bool) -> String {
    let label = status.to_string();
    match (color, status) {
        (false, _) => label,
        (true, OperationStatus::Completed) => label.green().to_string(),
        (true, OperationStatus::Pending) => label.yellow().to_string(),
        (true, OperationStatus::Failed | OperationStatus::Timeout) => label.red().to_string(),
    }
}

/// Serialized form for the machine formats; `None` for human ones.
fn structured<T: Serialize + ?Sized>(format: OutputFormat, data: &T) -> Option<String> {
    let rendered = match format {
        OutputFormat::Json => serde_json::to_string_pretty(data).map_err(|e| e.to_string()),
        OutputFormat::JsonCompact => serde_json::to_string(data).map_err(|e| e.to_string()),
        OutputFormat::Yaml => serde_yaml::to_string(data).map_err(|e| e.to_string()),
        OutputFormat::Table | OutputFormat::Plain => return None,
    };
    Some(rendered.unwrap_or_else(|e| format!("error: could not serialize output: {e}")))
}

/// Several items: a rounded table of `row`, or one `plain` line per item.
pub fn render_list<T, R>(
    format: OutputFormat,
    items: &[T],
    row: impl Fn(&T) -> R,
    plain: impl Fn(&T) -> String,
) -> String
where
    T: Serialize,
    R: Tabled,
{
    if let Some(out) = structured(format, items) {
        return out;
    }
    if format == OutputFormat::Plain {
        return items.iter().map(plain).collect::<Vec<_>>().join("\n");
    }
    let rows: Vec<R> = items.iter().map(row).collect();
    Table::new(rows).with(Style::rounded()).to_string()
}

/// One item: `detail` for tables, `plain` for plain output.
pub fn render_single<T: Serialize>(
    format: OutputFormat,
    item: &T,
    detail: impl Fn(&T) -> String,
    plain: impl Fn(&T) -> String,
) -> String {
    structured(format, item).unwrap_or_else(|| match format {
        OutputFormat::Plain => plain(item),
        _ => detail(item),
    })
}

/// Single-line JSON for streamed output.
pub fn render_json_line<T: Serialize + ?Sized>(item: &T) -> String {
    structured(OutputFormat::JsonCompact, item).unwrap_or_default()
}

/// `key  value` lines with keys padded to the widest one.
pub fn detail_lines(pairs: &[(&str, String)]) -> String {
    let width = pairs.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    pairs
        .iter()
        .map(|(k, v)| format!("{k:<width$}  {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn print_output(out: &str, quiet: bool) {
    if quiet || out.is_empty() {
        return;
    }
    // Ignore EPIPE from `hubwatch watch | head`.
    let _ = writeln!(io::stdout().lock(), "{out}");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Entity {
        id: &'static str,
    }

    #[derive(Tabled)]
    struct EntityRow {
        #[tabled(rename = "Entity")]
        id: &'static str,
    }

    fn entities() -> [Entity; 2] {
        [Entity { id: "light.kitchen" }, Entity { id: "lock.front" }]
    }

    fn list(format: OutputFormat) -> String {
        render_list(format, &entities(), |e| EntityRow { id: e.id }, |e| e.id.to_owned())
    }

    #[test]
    fn plain_lists_one_id_per_line() {
        assert_eq!(list(OutputFormat::Plain), "light.kitchen\nlock.front");
    }

    #[test]
    fn table_has_headers_and_rows() {
        let out = list(OutputFormat::Table);
        assert!(out.contains("Entity"));
        assert!(out.contains("lock.front"));
    }

    #[test]
    fn machine_formats_serialize_the_items() {
        assert_eq!(
            list(OutputFormat::JsonCompact),
            r#"[{"id":"light.kitchen"},{"id":"lock.front"}]"#
        );
        assert!(list(OutputFormat::Yaml).contains("- id: light.kitchen"));
    }

    #[test]
    fn single_items_pick_the_view_by_format() {
        let item = Entity { id: "light.kitchen" };
        let view = |format| render_single(format, &item, |_| "detail".into(), |e| e.id.to_owned());
        assert_eq!(view(OutputFormat::Table), "detail");
        assert_eq!(view(OutputFormat::Plain), "light.kitchen");
        assert_eq!(render_json_line(&item), r#"{"id":"light.kitchen"}"#);
    }

    #[test]
    fn detail_lines_align_keys() {
        let out = detail_lines(&[("id", "1".into()), ("status", "pending".into())]);
        assert_eq!(out, "id      1\nstatus  pending");
    }

    #[test]
    fn uncolored_status_is_the_bare_label() {
        assert_eq!(status_label(OperationStatus::Timeout, false), "timeout");
    }
}
