use std::fmt::Write as _;

use async_trait::async_trait;
use copilot_core::{
    format_number, Agent, AgentError, AgentKind, AgentResult, ChartKind, ChartSeries, ChartSpec,
    ColumnStats, DataTable, Figure, Payload, SharedContext, Task,
};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::prompt::{self, ANALYST_SYSTEM};
use crate::sales::{SalesInsights, Trend};
use crate::LlmHandle;

/// Statistics over the caller's table, narrated by one LLM call.
///
/// The numbers are always computed locally; the model only explains them.
/// Malformed tables fail with `InvalidInput` instead of producing charts.
/// Transient narrative failures are returned for the orchestrator to retry;
/// permanent ones leave a `Partial` result with the statistics.
pub struct DataAnalystAgent {
    llm: LlmHandle,
}

impl DataAnalystAgent {
    pub fn new(llm: LlmHandle) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Agent for DataAnalystAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Analyze
    }

    #[instrument(name = "agent.analyze", skip(self, task, context), fields(attempt = task.attempt()))]
    async fn run(&self, task: &Task, context: &SharedContext) -> Result<AgentResult, AgentError> {
        let table = context
            .table()
            .ok_or_else(|| AgentError::invalid_input("no tabular data was supplied"))?;
        table.validate()?;

        let stats = table
            .numeric_columns()
            .into_iter()
            .map(|column| table.column_stats(column))
            .collect::<Result<Vec<_>, _>>()?;
        let insights = SalesInsights::compute(table)?;
        info!(
            rows = table.len(),
            numeric_columns = stats.len(),
            sales_schema = insights.is_some(),
            "computed table statistics"
        );

        let figures = match &insights {
            Some(insights) => sales_figures(insights),
            None => generic_figures(&stats),
        };
        let charts = match &insights {
            Some(insights) => sales_charts(insights),
            None => generic_charts(&stats),
        };
        let headline = headline(table, &figures, insights.as_ref());
        let details = json!({
            "rows": table.len(),
            "columns": table.columns(),
            "column_stats": stats,
            "sales": insights,
        });

        let statistics = statistics_digest(&headline, &figures, insights.as_ref());
        let narrative = self
            .llm
            .complete(
                ANALYST_SYSTEM,
                prompt::analysis_prompt(task, context.profile(), &statistics),
            )
            .await;

        let confidence = confidence(table, insights.is_some(), narrative.is_ok());
        let mut payload = Payload {
            summary: headline,
            figures,
            charts,
            details,
            ..Payload::default()
        };

        match narrative {
            Ok(text) => {
                payload.summary = format!("{}\n\n{}", payload.summary, text.trim());
                Ok(AgentResult::ok(payload, Some(confidence)))
            }
            Err(err) if err.is_retryable() => Err(err),
            Err(err) => {
                warn!(error = %err, "narrative unavailable, keeping statistics only");
                Ok(AgentResult::partial(payload, Some(confidence), err))
            }
        }
    }
}

fn sales_figures(insights: &SalesInsights) -> Vec<Figure> {
    let mut figures = vec![
        Figure::new("revenue", insights.total_revenue).with_label("Total revenue in the data"),
        Figure::new("total_profit", insights.total_profit).with_label("Total gross profit"),
        Figure::new("avg_margin_pct", round2(insights.avg_margin_pct))
            .with_unit("%")
            .with_label("Average profit margin across products"),
        Figure::new("products", insights.products.len() as f64).with_label("Distinct products"),
    ];
    if !insights.restock_alerts.is_empty() {
        figures.push(
            Figure::new("restock_alerts", insights.restock_alerts.len() as f64)
                .with_label("Products running low on stock"),
        );
    }
    figures
}

fn generic_figures(stats: &[ColumnStats]) -> Vec<Figure> {
    stats
        .iter()
        .flat_map(|s| {
            let name = s.column.to_lowercase();
            if name == "revenue" {
                vec![Figure::new("revenue", s.sum).with_label("Total of the revenue column")]
            } else {
                vec![
                    Figure::new(format!("{name}_total"), s.sum),
                    Figure::new(format!("{name}_mean"), round2(s.mean)),
                ]
            }
        })
        .collect()
}

fn sales_charts(insights: &SalesInsights) -> Vec<ChartSpec> {
    let mut charts = vec![ChartSpec {
        kind: ChartKind::Bar,
        title: "Revenue and profit by product".to_string(),
        x_label: "Product".to_string(),
        y_label: "Amount".to_string(),
        categories: insights.products.iter().map(|p| p.product.clone()).collect(),
        series: vec![
            ChartSeries {
                name: "revenue".to_string(),
                values: insights.products.iter().map(|p| p.revenue).collect(),
            },
            ChartSeries {
                name: "profit".to_string(),
                values: insights.products.iter().map(|p| p.profit).collect(),
            },
        ],
    }];

    if !insights.daily_quantity.is_empty() {
        charts.push(ChartSpec {
            kind: ChartKind::Line,
            title: "Units sold over time".to_string(),
            x_label: "Date".to_string(),
            y_label: "Units".to_string(),
            categories: insights.daily_quantity.iter().map(|(d, _)| d.clone()).collect(),
            series: vec![ChartSeries {
                name: "quantity_sold".to_string(),
                values: insights.daily_quantity.iter().map(|(_, q)| *q).collect(),
            }],
        });
    }
    charts
}

fn generic_charts(stats: &[ColumnStats]) -> Vec<ChartSpec> {
    vec![ChartSpec {
        kind: ChartKind::Bar,
        title: "Column totals".to_string(),
        x_label: "Column".to_string(),
        y_label: "Total".to_string(),
        categories: stats.iter().map(|s| s.column.clone()).collect(),
        series: vec![ChartSeries {
            name: "total".to_string(),
            values: stats.iter().map(|s| s.sum).collect(),
        }],
    }]
}

fn headline(table: &DataTable, figures: &[Figure], insights: Option<&SalesInsights>) -> String {
    match insights {
        Some(insights) => {
            let mut line = format!(
                "Analyzed {} sales rows across {} products: revenue {}, profit {} (average margin {}%).",
                table.len(),
                insights.products.len(),
                format_number(insights.total_revenue),
                format_number(insights.total_profit),
                format_number(insights.avg_margin_pct),
            );
            if let Some(best) = insights.best_seller() {
                let _ = write!(line, " {} is the most profitable product.", best.product);
            }
            if !insights.trends.is_empty() {
                let _ = write!(
                    line,
                    " Demand is rising for {} and declining for {} product(s).",
                    insights.count_trend(Trend::Rising),
                    insights.count_trend(Trend::Declining)
                );
            }
            line
        }
        None => {
            let quoted: Vec<String> = figures
                .iter()
                .take(4)
                .map(|f| format!("{} {}", f.name, f.display_value()))
                .collect();
            format!(
                "Analyzed {} rows and {} columns: {}.",
                table.len(),
                table.columns().len(),
                quoted.join(", ")
            )
        }
    }
}

fn statistics_digest(headline: &str, figures: &[Figure], insights: Option<&SalesInsights>) -> String {
    let mut digest = format!("{headline}\n");
    for figure in figures {
        let _ = writeln!(digest, "- {} = {}", figure.name, figure.display_value());
    }
    if let Some(insights) = insights {
        for weak in insights.weak_products.iter().take(3) {
            let _ = writeln!(digest, "- weak product {}: {}", weak.product, weak.issues.join(", "));
        }
        for alert in insights.restock_alerts.iter().take(3) {
            let _ = writeln!(
                digest,
                "- {}: {:.1} weeks of stock left, {}",
                alert.product, alert.weeks_of_stock, alert.action
            );
        }
    }
    digest
}

fn confidence(table: &DataTable, sales_schema: bool, narrated: bool) -> f64 {
    let mut confidence = 0.6;
    if sales_schema {
        confidence += 0.15;
    }
    if table.len() >= 10 {
        confidence += 0.1;
    }
    if narrated {
        confidence += 0.1;
    }
    confidence
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
