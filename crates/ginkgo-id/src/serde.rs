use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// (De)serializes a [`Duration`](core::time::Duration) as an integer number
/// of milliseconds.
///
/// ```
/// # use core::time::Duration;
/// #[derive(serde::Serialize, serde::Deserialize)]
/// struct Knobs {
///     #[serde(with = "ginkgo_id::as_millis")]
///     max_idle_time: Duration,
/// }
///
/// let knobs: Knobs = serde_json::from_str(r#"{"max_idle_time":250}"#).unwrap();
/// assert_eq!(knobs.max_idle_time, Duration::from_millis(250));
/// ```
pub mod as_millis {
    use super::{Deserialize, Deserializer, Serialize, Serializer};
    use core::time::Duration;

    /// # Errors
    ///
    /// Returns an error if the underlying serializer fails or the duration
    /// does not fit in a `u64` of milliseconds.
    pub fn serialize<S>(duration: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).map_err(serde::ser::Error::custom)?;
        millis.serialize(s)
    }

    /// # Errors
    ///
    /// Returns an error if the underlying deserializer fails.
    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
