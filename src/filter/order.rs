use serde::{Deserialize, Serialize};

/// Order applied when breaking ties between selection candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Order {
    #[default]
    Shuffle,
    ChronologicalDescending,
    ChronologicalAscending,
}

impl Order {
    /// Returns `(order_sql, extra_filter_sql)`. The extra filter narrows the
    /// candidate set so the order expression is well-defined for every row.
    pub fn to_sql(self) -> (&'static str, Option<&'static str>) {
        match self {
            Order::Shuffle => ("RANDOM()", None),
            Order::ChronologicalDescending => {
                ("datetime(capture_date) DESC", Some("capture_date IS NOT NULL"))
            }
            Order::ChronologicalAscending => {
                ("datetime(capture_date) ASC", Some("capture_date IS NOT NULL"))
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Order::Shuffle => "SHUFFLE",
            Order::ChronologicalDescending => "CHRONOLOGICAL_DESCENDING",
            Order::ChronologicalAscending => "CHRONOLOGICAL_ASCENDING",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "SHUFFLE" => Some(Order::Shuffle),
            "CHRONOLOGICAL_DESCENDING" => Some(Order::ChronologicalDescending),
            "CHRONOLOGICAL_ASCENDING" => Some(Order::ChronologicalAscending),
            _ => None,
        }
    }
}

impl std::fmt::Display for Order {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
