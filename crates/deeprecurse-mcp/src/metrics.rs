use std::collections::HashMap;

use deeprecurse_sandbox::BackendStats;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Debug, Default, Clone)]
struct ToolMetric {
    ok: u64,
    err: u64,
    total_latency_ms: f64,
    max_latency_ms: f64,
}

impl ToolMetric {
    fn calls(&self) -> u64 {
        self.ok.saturating_add(self.err)
    }
}

/// Per-tool call counters and latency. Only tool names that parsed are
/// recorded, so the label set stays closed.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    tools: Mutex<HashMap<String, ToolMetric>>,
}

impl MetricsRegistry {
    pub fn record_tool(&self, tool: &str, latency_ms: f64, is_error: bool) {
        let mut tools = self.tools.lock();
        let metric = tools.entry(tool.to_string()).or_default();
        if is_error {
            metric.err = metric.err.saturating_add(1);
        } else {
            metric.ok = metric.ok.saturating_add(1);
        }
        metric.total_latency_ms += latency_ms;
        metric.max_latency_ms = metric.max_latency_ms.max(latency_ms);
    }

    fn sorted_tools(&self) -> Vec<(String, ToolMetric)> {
        let mut tools: Vec<_> = self
            .tools
            .lock()
            .iter()
            .map(|(name, m)| (name.clone(), m.clone()))
            .collect();
        tools.sort_by(|a, b| a.0.cmp(&b.0));
        tools
    }

    /// Prometheus text exposition of tool and backend counters.
    pub fn render_text(&self, backend: &BackendStats) -> String {
        let mut lines = vec![
            "# TYPE deeprecurse_tool_calls_total counter".to_string(),
            "# TYPE deeprecurse_tool_latency_ms_sum counter".to_string(),
            "# TYPE deeprecurse_tool_latency_ms_count counter".to_string(),
            "# TYPE deeprecurse_tool_latency_ms_max gauge".to_string(),
            "# TYPE deeprecurse_backend_calls_total counter".to_string(),
            "# TYPE deeprecurse_backend_starts_total counter".to_string(),
            "# TYPE deeprecurse_backend_connect_failures_total counter".to_string(),
            "# TYPE deeprecurse_backend_unavailable_total counter".to_string(),
            "# TYPE deeprecurse_backend_api_errors_total counter".to_string(),
            "# TYPE deeprecurse_backend_timeouts_total counter".to_string(),
        ];

        for (tool, m) in self.sorted_tools() {
            let label = prom_label_value(&tool);
            lines.push(format!(
                "deeprecurse_tool_calls_total{{tool=\"{label}\",status=\"ok\"}} {}",
                m.ok
            ));
            lines.push(format!(
                "deeprecurse_tool_calls_total{{tool=\"{label}\",status=\"error\"}} {}",
                m.err
            ));
            lines.push(format!(
                "deeprecurse_tool_latency_ms_sum{{tool=\"{label}\"}} {:.3}",
                m.total_latency_ms
            ));
            lines.push(format!(
                "deeprecurse_tool_latency_ms_count{{tool=\"{label}\"}} {}",
                m.calls()
            ));
            lines.push(format!(
                "deeprecurse_tool_latency_ms_max{{tool=\"{label}\"}} {:.3}",
                m.max_latency_ms
            ));
        }

        lines.push(format!("deeprecurse_backend_calls_total {}", backend.calls));
        lines.push(format!("deeprecurse_backend_starts_total {}", backend.starts));
        lines.push(format!(
            "deeprecurse_backend_connect_failures_total {}",
            backend.connect_failures
        ));
        lines.push(format!(
            "deeprecurse_backend_unavailable_total {}",
            backend.unavailable
        ));
        lines.push(format!(
            "deeprecurse_backend_api_errors_total {}",
            backend.api_errors
        ));
        lines.push(format!(
            "deeprecurse_backend_timeouts_total {}",
            backend.timeouts
        ));
        lines.join("\n")
    }

    pub fn render_summary(&self, backend: &BackendStats) -> Value {
        let mut tools = Map::new();
        let mut total_calls = 0_u64;
        let mut total_errors = 0_u64;
        for (tool, m) in self.sorted_tools() {
            let calls = m.calls();
            total_calls = total_calls.saturating_add(calls);
            total_errors = total_errors.saturating_add(m.err);
            let avg_latency_ms = if calls == 0 {
                0.0
            } else {
                m.total_latency_ms / calls as f64
            };
            tools.insert(
                tool,
                json!({
                    "ok": m.ok,
                    "error": m.err,
                    "avg_latency_ms": avg_latency_ms,
                    "max_latency_ms": m.max_latency_ms
                }),
            );
        }
        let tool_error_ratio = if total_calls == 0 {
            0.0
        } else {
            total_errors as f64 / total_calls as f64
        };

        json!({
            "status": "ok",
            "tool_calls": total_calls,
            "tool_error_ratio": tool_error_ratio,
            "tools": tools,
            "backend": backend
        })
    }
}

fn prom_label_value(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', " ")
}
