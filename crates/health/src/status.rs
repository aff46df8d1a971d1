use std::collections::BTreeMap;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Up,
    Down,
    Unknown,
}

impl Status {
    /// Composite rule: DOWN if any child is DOWN, else UNKNOWN if any child
    /// is UNKNOWN, else UP.
    pub fn aggregate(children: impl IntoIterator<Item = Status>) -> Status {
        let mut overall = Status::Up;
        for status in children {
            match status {
                Status::Down => return Status::Down,
                Status::Unknown => overall = Status::Unknown,
                Status::Up => (),
            }
        }
        overall
    }
}

/// Outcome of a single checker invocation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckResult {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(serialize_with = "ser_duration")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl CheckResult {
    pub fn up() -> Self {
        Self::of(Status::Up)
    }

    pub fn down(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::of(Status::Down)
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::of(Status::Unknown)
        }
    }

    pub fn of(status: Status) -> Self {
        Self {
            status,
            message: None,
            duration: Duration::ZERO,
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// Aggregated response for one lane: overall status plus per-checker results.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Report {
    pub status: Status,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(serialize_with = "ser_duration")]
    pub duration: Duration,
    pub checks: BTreeMap<String, CheckResult>,
}

impl Report {
    pub fn up() -> Self {
        Self {
            status: Status::Up,
            timestamp: OffsetDateTime::now_utc(),
            duration: Duration::ZERO,
            checks: BTreeMap::new(),
        }
    }
}

fn ser_duration<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    // Sub-millisecond noise is useless in health output.
    let rounded = Duration::from_millis(d.as_millis() as u64);
    s.serialize_str(&humantime::format_duration(rounded).to_string())
}
