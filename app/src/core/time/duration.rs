#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Duration {
    #[serde(with = "duration_format")]
    delegate: chrono::Duration,
}

impl Duration {
    pub(super) fn new(delegate: chrono::Duration) -> Self {
        Self { delegate }
    }

    pub fn zero() -> Self {
        Self::new(chrono::Duration::zero())
    }

    pub fn hours(hours: i64) -> Self {
        Self::new(chrono::Duration::hours(hours))
    }

    pub fn minutes(minutes: i64) -> Self {
        Self::new(chrono::Duration::minutes(minutes))
    }

    pub fn seconds(seconds: i64) -> Self {
        Self::new(chrono::Duration::seconds(seconds))
    }

    pub fn millis(millis: i64) -> Self {
        Self::new(chrono::Duration::milliseconds(millis))
    }

    pub fn as_secs(&self) -> i64 {
        self.delegate.num_seconds()
    }

    pub fn as_minutes(&self) -> i64 {
        self.delegate.num_minutes()
    }

    pub fn as_hours(&self) -> i64 {
        self.delegate.num_hours()
    }

    pub fn is_positive(&self) -> bool {
        self.delegate > chrono::Duration::zero()
    }

    pub fn into_db(self) -> chrono::Duration {
        self.delegate
    }
}

impl std::ops::Add<Duration> for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Self::Output {
        Self {
            delegate: self.delegate + rhs.delegate,
        }
    }
}

impl From<Duration> for std::time::Duration {
    fn from(val: Duration) -> Self {
        let millis = val.delegate.num_milliseconds().max(0);
        std::time::Duration::from_millis(millis as u64)
    }
}

mod duration_format {
    use iso8601_duration::Duration as Iso8601Duration;
    use serde::{Deserializer, Serializer, de::Visitor};

    pub fn serialize<S>(duration: &chrono::TimeDelta, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let seconds = duration.num_seconds();
        let iso_duration = Iso8601Duration::new(
            0.0,
            0.0,
            0.0,
            (seconds / 3600) as f32,
            ((seconds % 3600) / 60) as f32,
            (seconds % 60) as f32,
        );
        serializer.serialize_str(&iso_duration.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<chrono::Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = chrono::TimeDelta;

            fn expecting(&self, formatter: &mut core::fmt::Formatter) -> core::fmt::Result {
                formatter.write_str("a string representing an ISO 8601 duration (e.g., PT2M30S)")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let iso_duration = Iso8601Duration::parse(value)
                    .map_err(|e| E::custom(format!("Error parsing {} to duration: {:?}", value, e)))?;

                match iso_duration.to_chrono() {
                    Some(duration) => Ok(duration),
                    None => Err(E::custom(format!(
                        "Duration must not contain years and/or months. Received {}",
                        value
                    ))),
                }
            }
        }

        deserializer.deserialize_str(DurationVisitor)
    }
}
