//! Sales-specific insights over a validated [`DataTable`].
//!
//! Only computed when the table carries the sales schema
//! (`product_name`, `quantity_sold`, `unit_price`, `unit_cost`). Trends need a
//! `date` column; restock alerts additionally need `stock_remaining`.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use copilot_core::{AgentError, DataTable};
use serde::Serialize;

const SALES_COLUMNS: [&str; 4] = ["product_name", "quantity_sold", "unit_price", "unit_cost"];

const TREND_THRESHOLD_PCT: f64 = 10.0;
const LOW_MARGIN_PCT: f64 = 15.0;
const LOW_CONTRIBUTION_PCT: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductProfit {
    pub product: String,
    pub quantity: f64,
    pub revenue: f64,
    pub profit: f64,
    pub margin_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Rising,
    Stable,
    Declining,
}

impl Trend {
    fn from_change(change_pct: f64) -> Self {
        if change_pct > TREND_THRESHOLD_PCT {
            Trend::Rising
        } else if change_pct < -TREND_THRESHOLD_PCT {
            Trend::Declining
        } else {
            Trend::Stable
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DemandTrend {
    pub trend: Trend,
    /// Second-half mean versus first-half mean, in percent
    pub change_pct: f64,
    pub avg_sales: f64,
    pub latest_sales: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeakProduct {
    pub product: String,
    pub issues: Vec<String>,
    pub severity: u32,
    pub margin_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Critical,
    High,
    Medium,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestockAlert {
    pub product: String,
    pub urgency: Urgency,
    pub current_stock: f64,
    pub avg_sales: f64,
    pub weeks_of_stock: f64,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryTotals {
    pub category: String,
    pub revenue: f64,
    pub profit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SalesInsights {
    pub products: Vec<ProductProfit>,
    pub trends: BTreeMap<String, DemandTrend>,
    pub weak_products: Vec<WeakProduct>,
    pub restock_alerts: Vec<RestockAlert>,
    pub categories: Vec<CategoryTotals>,
    /// Total quantity sold per date, in date order
    pub daily_quantity: Vec<(String, f64)>,
    pub total_revenue: f64,
    pub total_profit: f64,
    pub avg_margin_pct: f64,
}

struct SaleRow<'a> {
    date: Option<NaiveDate>,
    date_raw: &'a str,
    product: &'a str,
    category: Option<&'a str>,
    quantity: f64,
    price: f64,
    cost: f64,
    stock: Option<f64>,
}

pub fn has_sales_schema(table: &DataTable) -> bool {
    SALES_COLUMNS.iter().all(|column| table.has_column(column))
}

impl SalesInsights {
    /// `Ok(None)` when the table is not a sales table.
    pub fn compute(table: &DataTable) -> Result<Option<Self>, AgentError> {
        if !has_sales_schema(table) {
            return Ok(None);
        }

        let rows = sale_rows(table)?;
        let products = profit_by_product(&rows);
        let total_revenue: f64 = products.iter().map(|p| p.revenue).sum();
        let total_profit: f64 = products.iter().map(|p| p.profit).sum();
        let avg_margin_pct = if products.is_empty() {
            0.0
        } else {
            products.iter().map(|p| p.margin_pct).sum::<f64>() / products.len() as f64
        };

        let dated = rows.iter().all(|row| row.date.is_some());
        let trends = if dated { demand_trends(&rows) } else { BTreeMap::new() };
        let weak_products = weak_products(&products, &trends, total_profit);
        let restock_alerts = restock_alerts(&rows, &trends);
        let categories = category_totals(&rows);
        let daily_quantity = if dated { daily_quantity(&rows) } else { Vec::new() };

        Ok(Some(Self {
            products,
            trends,
            weak_products,
            restock_alerts,
            categories,
            daily_quantity,
            total_revenue,
            total_profit,
            avg_margin_pct,
        }))
    }

    pub fn count_trend(&self, trend: Trend) -> usize {
        self.trends.values().filter(|t| t.trend == trend).count()
    }

    pub fn best_seller(&self) -> Option<&ProductProfit> {
        self.products.first()
    }
}

/// Rows in chronological order when every row carries a parseable date,
/// otherwise in input order.
fn sale_rows(table: &DataTable) -> Result<Vec<SaleRow<'_>>, AgentError> {
    let quantity = table.numeric_column("quantity_sold")?;
    let price = table.numeric_column("unit_price")?;
    let cost = table.numeric_column("unit_cost")?;
    let stock = if table.has_column("stock_remaining") {
        Some(table.numeric_column("stock_remaining")?)
    } else {
        None
    };
    let products = table.column("product_name").unwrap_or_default();
    let dates = table.column("date");
    let categories = table.column("category");

    let mut rows: Vec<SaleRow<'_>> = (0..table.len())
        .map(|idx| {
            let date_raw = dates.as_ref().map(|d| d[idx]).unwrap_or("");
            SaleRow {
                date: NaiveDate::parse_from_str(date_raw, "%Y-%m-%d").ok(),
                date_raw,
                product: products.get(idx).copied().unwrap_or(""),
                category: categories.as_ref().map(|c| c[idx]).filter(|c| !c.is_empty()),
                quantity: quantity[idx],
                price: price[idx],
                cost: cost[idx],
                stock: stock.as_ref().map(|s| s[idx]),
            }
        })
        .filter(|row| !row.product.is_empty())
        .collect();

    if rows.iter().all(|row| row.date.is_some()) {
        rows.sort_by_key(|row| row.date);
    }
    Ok(rows)
}

/// Products ordered by profit, highest first.
fn profit_by_product(rows: &[SaleRow<'_>]) -> Vec<ProductProfit> {
    let mut totals: BTreeMap<&str, (f64, f64, f64)> = BTreeMap::new();
    for row in rows {
        let entry = totals.entry(row.product).or_default();
        entry.0 += row.quantity;
        entry.1 += row.quantity * row.price;
        entry.2 += row.quantity * (row.price - row.cost);
    }

    let mut products: Vec<ProductProfit> = totals
        .into_iter()
        .map(|(product, (quantity, revenue, profit))| ProductProfit {
            product: product.to_string(),
            quantity,
            revenue,
            profit,
            margin_pct: if revenue > 0.0 { profit / revenue * 100.0 } else { 0.0 },
        })
        .collect();
    products.sort_by(|a, b| b.profit.total_cmp(&a.profit));
    products
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn demand_trends(rows: &[SaleRow<'_>]) -> BTreeMap<String, DemandTrend> {
    let mut series: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for row in rows {
        series.entry(row.product).or_default().push(row.quantity);
    }

    series
        .into_iter()
        .filter(|(_, sales)| sales.len() >= 2)
        .map(|(product, sales)| {
            let (first, second) = sales.split_at(sales.len() / 2);
            let first_mean = mean(first);
            let change_pct = if first_mean > 0.0 {
                (mean(second) - first_mean) / first_mean * 100.0
            } else {
                0.0
            };
            let trend = DemandTrend {
                trend: Trend::from_change(change_pct),
                change_pct,
                avg_sales: mean(&sales),
                latest_sales: sales.last().copied().unwrap_or_default(),
            };
            (product.to_string(), trend)
        })
        .collect()
}

/// Products with thin margins, falling demand or a negligible profit share,
/// most severe first.
fn weak_products(
    products: &[ProductProfit],
    trends: &BTreeMap<String, DemandTrend>,
    total_profit: f64,
) -> Vec<WeakProduct> {
    let mut weak: Vec<WeakProduct> = products
        .iter()
        .filter_map(|product| {
            let mut issues = Vec::new();
            let mut severity = 0;

            if product.margin_pct < LOW_MARGIN_PCT {
                issues.push(format!("low profit margin ({:.1}%)", product.margin_pct));
                severity += 2;
            }
            if let Some(trend) = trends.get(&product.product) {
                if trend.change_pct < -15.0 {
                    issues.push(format!("declining demand ({:.1}%)", trend.change_pct));
                    severity += 3;
                } else if trend.change_pct < -5.0 {
                    issues.push(format!("slightly declining demand ({:.1}%)", trend.change_pct));
                    severity += 1;
                }
            }
            if total_profit > 0.0 {
                let share = product.profit / total_profit * 100.0;
                if share < LOW_CONTRIBUTION_PCT {
                    issues.push(format!("low contribution to profit ({share:.1}%)"));
                    severity += 1;
                }
            }

            (!issues.is_empty()).then(|| WeakProduct {
                product: product.product.clone(),
                issues,
                severity,
                margin_pct: product.margin_pct,
            })
        })
        .collect();
    weak.sort_by(|a, b| b.severity.cmp(&a.severity));
    weak
}

fn restock_alerts(
    rows: &[SaleRow<'_>],
    trends: &BTreeMap<String, DemandTrend>,
) -> Vec<RestockAlert> {
    let mut latest_stock: BTreeMap<&str, f64> = BTreeMap::new();
    for row in rows {
        if let Some(stock) = row.stock {
            latest_stock.insert(row.product, stock);
        }
    }

    let mut alerts: Vec<RestockAlert> = latest_stock
        .into_iter()
        .filter_map(|(product, stock)| {
            let trend = trends.get(product)?;
            if trend.avg_sales <= 0.0 {
                return None;
            }
            let weeks = stock / trend.avg_sales;
            let mut urgency = if weeks < 1.0 {
                Urgency::Critical
            } else if weeks < 2.0 {
                Urgency::High
            } else if weeks < 4.0 {
                Urgency::Medium
            } else {
                return None;
            };

            let rising = trend.trend == Trend::Rising && weeks < 3.0;
            if rising && urgency == Urgency::Medium {
                urgency = Urgency::High;
            }

            let mut action = match urgency {
                Urgency::Critical => "Restock immediately".to_string(),
                Urgency::High => "Restock this week".to_string(),
                Urgency::Medium => "Plan a restock within two weeks".to_string(),
            };
            if rising {
                action.push_str(" (demand is rising)");
            }

            Some(RestockAlert {
                product: product.to_string(),
                urgency,
                current_stock: stock,
                avg_sales: trend.avg_sales,
                weeks_of_stock: weeks,
                action,
            })
        })
        .collect();
    alerts.sort_by_key(|alert| alert.urgency);
    alerts
}

fn category_totals(rows: &[SaleRow<'_>]) -> Vec<CategoryTotals> {
    let mut totals: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
    for row in rows {
        if let Some(category) = row.category {
            let entry = totals.entry(category).or_default();
            entry.0 += row.quantity * row.price;
            entry.1 += row.quantity * (row.price - row.cost);
        }
    }

    let mut categories: Vec<CategoryTotals> = totals
        .into_iter()
        .map(|(category, (revenue, profit))| CategoryTotals {
            category: category.to_string(),
            revenue,
            profit,
        })
        .collect();
    categories.sort_by(|a, b| b.revenue.total_cmp(&a.revenue));
    categories
}

fn daily_quantity(rows: &[SaleRow<'_>]) -> Vec<(String, f64)> {
    let mut per_day: BTreeMap<NaiveDate, (String, f64)> = BTreeMap::new();
    for row in rows {
        if let Some(date) = row.date {
            let entry = per_day
                .entry(date)
                .or_insert_with(|| (row.date_raw.to_string(), 0.0));
            entry.1 += row.quantity;
        }
    }
    per_day.into_values().collect()
}
