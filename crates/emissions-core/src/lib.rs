//! Core domain model for carbon-emission ingestion: scopes, partitions, the
//! canonical item-details schema and the report window planner.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "emissions-core";

/// Name of the destination table every partition is appended to.
pub const TABLE_NAME: &str = "item_details_emissions";

/// Number of report months covered by one run.
pub const WINDOW_MONTHS: u32 = 12;

/// Reports lag the calendar by this many months; newer months come back empty.
pub const REPORT_LAG_MONTHS: u32 = 2;

/// Day the run date is pinned to before counting months back.
pub const CUTOFF_DAY: u32 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EmissionScope {
    Scope1,
    Scope2,
    Scope3,
}

impl EmissionScope {
    pub const ALL: [EmissionScope; 3] = [Self::Scope1, Self::Scope2, Self::Scope3];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scope1 => "Scope1",
            Self::Scope2 => "Scope2",
            Self::Scope3 => "Scope3",
        }
    }
}

impl fmt::Display for EmissionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown emission scope `{0}`")]
pub struct UnknownScope(pub String);

impl FromStr for EmissionScope {
    type Err = UnknownScope;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| UnknownScope(s.to_string()))
    }
}

/// One (report month, scope) unit of ingestion work and of storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub month: NaiveDate,
    pub scope: EmissionScope,
}

impl PartitionKey {
    pub fn new(month: NaiveDate, scope: EmissionScope) -> Self {
        Self { month, scope }
    }

    /// `YYYY-MM-DD` form of the month, as sent to the reporting API.
    pub fn month_str(&self) -> String {
        format_month(self.month)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", format_month(self.month), self.scope)
    }
}

pub fn format_month(month: NaiveDate) -> String {
    month.format("%Y-%m-%d").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Utf8,
    Float64,
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub column_type: ColumnType,
}

const fn column(name: &'static str, column_type: ColumnType) -> ColumnSpec {
    ColumnSpec { name, column_type }
}

/// Canonical column order and types of `item_details_emissions`.
/// Every column is nullable.
pub const ITEM_DETAILS_COLUMNS: [ColumnSpec; 13] = [
    column("itemName", ColumnType::Utf8),
    column("latestMonthEmissions", ColumnType::Float64),
    column("previousMonthEmissions", ColumnType::Float64),
    column("monthOverMonthEmissionsChangeRatio", ColumnType::Float64),
    column("monthlyEmissionsChangeValue", ColumnType::Float64),
    column("reportMonth", ColumnType::Date),
    column("emissionScope", ColumnType::Utf8),
    column("subscriptionId", ColumnType::Utf8),
    column("resourceGroup", ColumnType::Utf8),
    column("resourceId", ColumnType::Utf8),
    column("resourceType", ColumnType::Utf8),
    column("location", ColumnType::Utf8),
    column("categoryType", ColumnType::Utf8),
];

/// A single reconciled row of the item-details report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmissionRecord {
    pub item_name: Option<String>,
    pub latest_month_emissions: Option<f64>,
    pub previous_month_emissions: Option<f64>,
    pub month_over_month_emissions_change_ratio: Option<f64>,
    pub monthly_emissions_change_value: Option<f64>,
    pub report_month: Option<NaiveDate>,
    pub emission_scope: Option<String>,
    pub subscription_id: Option<String>,
    pub resource_group: Option<String>,
    pub resource_id: Option<String>,
    pub resource_type: Option<String>,
    pub location: Option<String>,
    pub category_type: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("`{column}` is not a {expected:?} column of item_details_emissions")]
pub struct UnknownColumn {
    pub column: String,
    pub expected: ColumnType,
}

impl UnknownColumn {
    fn new(column: &str, expected: ColumnType) -> Self {
        Self {
            column: column.to_string(),
            expected,
        }
    }
}

/// Column-addressed access, so readers and writers can walk
/// [`ITEM_DETAILS_COLUMNS`] instead of naming every field.
impl EmissionRecord {
    /// Whether the row is stamped with the given partition.
    pub fn belongs_to(&self, key: &PartitionKey) -> bool {
        self.report_month == Some(key.month)
            && self.emission_scope.as_deref() == Some(key.scope.as_str())
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        match column {
            "itemName" => self.item_name.as_deref(),
            "emissionScope" => self.emission_scope.as_deref(),
            "subscriptionId" => self.subscription_id.as_deref(),
            "resourceGroup" => self.resource_group.as_deref(),
            "resourceId" => self.resource_id.as_deref(),
            "resourceType" => self.resource_type.as_deref(),
            "location" => self.location.as_deref(),
            "categoryType" => self.category_type.as_deref(),
            _ => None,
        }
    }

    pub fn number(&self, column: &str) -> Option<f64> {
        match column {
            "latestMonthEmissions" => self.latest_month_emissions,
            "previousMonthEmissions" => self.previous_month_emissions,
            "monthOverMonthEmissionsChangeRatio" => self.month_over_month_emissions_change_ratio,
            "monthlyEmissionsChangeValue" => self.monthly_emissions_change_value,
            _ => None,
        }
    }

    pub fn date(&self, column: &str) -> Option<NaiveDate> {
        match column {
            "reportMonth" => self.report_month,
            _ => None,
        }
    }

    pub fn set_text(&mut self, column: &str, value: Option<String>) -> Result<(), UnknownColumn> {
        let slot = match column {
            "itemName" => &mut self.item_name,
            "emissionScope" => &mut self.emission_scope,
            "subscriptionId" => &mut self.subscription_id,
            "resourceGroup" => &mut self.resource_group,
            "resourceId" => &mut self.resource_id,
            "resourceType" => &mut self.resource_type,
            "location" => &mut self.location,
            "categoryType" => &mut self.category_type,
            _ => return Err(UnknownColumn::new(column, ColumnType::Utf8)),
        };
        *slot = value;
        Ok(())
    }

    pub fn set_number(&mut self, column: &str, value: Option<f64>) -> Result<(), UnknownColumn> {
        let slot = match column {
            "latestMonthEmissions" => &mut self.latest_month_emissions,
            "previousMonthEmissions" => &mut self.previous_month_emissions,
            "monthOverMonthEmissionsChangeRatio" => &mut self.month_over_month_emissions_change_ratio,
            "monthlyEmissionsChangeValue" => &mut self.monthly_emissions_change_value,
            _ => return Err(UnknownColumn::new(column, ColumnType::Float64)),
        };
        *slot = value;
        Ok(())
    }

    pub fn set_date(&mut self, column: &str, value: Option<NaiveDate>) -> Result<(), UnknownColumn> {
        match column {
            "reportMonth" => {
                self.report_month = value;
                Ok(())
            }
            _ => Err(UnknownColumn::new(column, ColumnType::Date)),
        }
    }
}

fn first_of_month(date: NaiveDate) -> Option<NaiveDate> {
    date.with_day(1)
}

/// Report months to ingest for a run happening on `today`, ascending.
///
/// The window is the [`WINDOW_MONTHS`] months ending [`REPORT_LAG_MONTHS`]
/// before the current month. Months are counted back from `today` pinned to
/// [`CUTOFF_DAY`], so any day within the same month yields the same window.
/// Returns an empty window rather than failing when the arithmetic runs out
/// of calendar.
pub fn report_window(today: NaiveDate) -> Vec<NaiveDate> {
    let Some(cutoff) = today.with_day(CUTOFF_DAY) else {
        return Vec::new();
    };
    let Some(latest) = today
        .checked_sub_months(Months::new(REPORT_LAG_MONTHS))
        .and_then(first_of_month)
    else {
        return Vec::new();
    };

    let mut months = (0..WINDOW_MONTHS)
        .filter_map(|i| cutoff.checked_sub_months(Months::new(i + REPORT_LAG_MONTHS)))
        .filter_map(first_of_month)
        .filter(|candidate| *candidate <= latest)
        .collect::<Vec<_>>();
    months.sort();
    months.dedup();
    months
}

/// Cross product of months and scopes, month-major.
pub fn all_partitions(months: &[NaiveDate], scopes: &[EmissionScope]) -> Vec<PartitionKey> {
    months
        .iter()
        .flat_map(|month| scopes.iter().map(|scope| PartitionKey::new(*month, *scope)))
        .collect()
}
