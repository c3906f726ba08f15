//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use super::commands::ContextInfo;
use crate::flow::{FlowDeployment, RoutingTable};
use crate::pod::TeardownReport;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();
    let mut push_row = |cells: Vec<String>| {
        let line = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| match widths.get(i) {
                Some(width) => format!("{:width$}", cell, width = *width),
                None => cell.clone(),
            })
            .collect::<Vec<_>>()
            .join("   ");
        output.push_str(line.trim_end());
        output.push('\n');
    };

    push_row(headers.iter().map(|h| h.to_uppercase()).collect());
    for row in rows {
        push_row(row);
    }

    output
}

// ============================================================================
// Context display
// ============================================================================

/// Format context list for display
pub fn format_context_list(contexts: &[ContextInfo]) -> String {
    let headers = &["", "NAME", "SERVER"];
    let rows: Vec<Vec<String>> = contexts
        .iter()
        .map(|ctx| {
            vec![
                if ctx.is_current { "*" } else { " " }.to_string(),
                ctx.name.clone(),
                ctx.server.clone(),
            ]
        })
        .collect();

    format_table(headers, rows)
}

/// Format current context for display
pub fn format_current_context(name: &str, server: &str) -> String {
    format!("Current context: {} ({})\n", name, server)
}

// ============================================================================
// Flow display
// ============================================================================

/// One row per unit, pods in start order, gateway last
pub fn format_plan(flow: &FlowDeployment) -> String {
    let headers = &["POD", "UNIT", "ROLE", "REPLICAS", "IMAGE", "ADDRESS"];
    let rows: Vec<Vec<String>> = flow
        .pods()
        .iter()
        .chain(std::iter::once(flow.gateway()))
        .flat_map(|pod| {
            pod.units().map(move |unit| {
                vec![
                    pod.name().to_string(),
                    unit.name().to_string(),
                    unit.kind().role_name().to_string(),
                    unit.replicas().to_string(),
                    unit.workload().image,
                    unit.to_node().ingress_address(),
                ]
            })
        })
        .collect();

    format!(
        "Flow: {} (namespace {})\n\n{}",
        flow.name(),
        flow.namespace(),
        format_table(headers, rows)
    )
}

/// Routing table as pretty JSON
pub fn format_routing_table(table: &RoutingTable) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(table)
}

/// Summary of a teardown
pub fn format_teardown_report(report: &TeardownReport) -> String {
    let mut output = format!("Deleted {} unit(s)\n", report.closed.len());
    for name in &report.closed {
        output.push_str(&format!("  - {}\n", name));
    }
    if !report.failures.is_empty() {
        output.push_str(&format!("{} failure(s):\n", report.failures.len()));
        for failure in &report.failures {
            output.push_str(&format!("  ! {}: {}\n", failure.unit, failure.message));
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::plan_flow;
    use crate::config::{parse_manifest, ManifestFormat};
    use crate::images::ImageConfig;
    use crate::pod::TeardownFailure;

    #[test]
    fn test_format_table_alignment() {
        let output = format_table(
            &["name", "server"],
            vec![
                vec!["a".to_string(), "https://x".to_string()],
                vec!["longer".to_string(), "y".to_string()],
            ],
        );
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(lines[0], "NAME     SERVER");
        assert_eq!(lines[1], "a        https://x");
        assert_eq!(lines[2], "longer   y");
    }

    #[test]
    fn test_format_table_empty() {
        assert_eq!(format_table(&["a"], vec![]), "No resources found.\n");
    }

    #[test]
    fn test_format_plan() {
        let manifest = parse_manifest(
            "name: search\npods:\n  - name: encoder\n    uses: acme/enc\n    shards: 2\n",
            ManifestFormat::Yaml,
        )
        .unwrap();
        let flow = plan_flow(&manifest, ImageConfig::default().with_version("0.1.0")).unwrap();
        let output = format_plan(&flow);

        assert!(output.starts_with("Flow: search (namespace search)"));
        assert!(output.contains("encoder-head"));
        assert!(output.contains("acme/enc"));
        assert!(output.contains("gateway.search.svc:8081"));
        assert!(output.contains("podweave/runtime:0.1.0-standard"));
    }

    #[test]
    fn test_format_teardown_report() {
        let report = TeardownReport {
            closed: vec!["gateway".to_string()],
            failures: vec![TeardownFailure {
                unit: "encoder".to_string(),
                message: "forbidden".to_string(),
            }],
        };
        let output = format_teardown_report(&report);
        assert!(output.contains("Deleted 1 unit(s)"));
        assert!(output.contains("! encoder: forbidden"));
    }
}
