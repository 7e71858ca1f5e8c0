// FaaS Metrics - append-only execution log and windowed aggregates
use thiserror::Error;

mod aggregator;
mod storage;
mod types;

pub use aggregator::MetricsAggregator;
pub use storage::{InMemoryStorage, RecordStore};
pub use types::*;

// Error Types
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Invalid time range: {0}")]
    InvalidTimeRange(String),
}

pub type Result<T> = std::result::Result<T, MetricsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_labels() {
        assert_eq!("1h".parse::<TimeRange>().unwrap(), TimeRange::hours(1));
        assert_eq!("24h".parse::<TimeRange>().unwrap(), TimeRange::default());
        assert_eq!("7d".parse::<TimeRange>().unwrap(), TimeRange::days(7));
        assert_eq!("30m".parse::<TimeRange>().unwrap(), TimeRange::minutes(30));
        assert_eq!(TimeRange::days(7).to_string(), "7d");
    }

    #[test]
    fn test_time_range_rejects_garbage() {
        for bad in ["", "h", "0h", "-1h", "12", "3w", "1.5h"] {
            assert!(
                matches!(bad.parse::<TimeRange>(), Err(MetricsError::InvalidTimeRange(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_oversized_range_starts_at_earliest_instant() {
        let range = "99999999d".parse::<TimeRange>().unwrap();
        let now = chrono::Utc::now();
        let window = range.window_ending(now);

        assert_eq!(window.start, chrono::DateTime::<chrono::Utc>::MIN_UTC);
        assert_eq!(window.end, now);
        assert!(window.contains(now - chrono::Duration::days(365)));
    }
}
