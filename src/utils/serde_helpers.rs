/// 序列化/反序列化辅助模块

use serde::{Deserialize, Deserializer, Serializer};

/// 处理 Java `LocalDateTime` 的多种 JSON 形态
///
/// 接受 ISO 本地时间（`2024-05-01T10:00:00`，可带小数秒）、带时区偏移的
/// RFC 3339 字符串，以及 Jackson 未注册 JavaTimeModule 时输出的数组
/// `[2024, 5, 1, 10, 0, 0, 123000000]`。序列化统一输出 ISO 本地时间。
pub mod java_datetime {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime};

    const LOCAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

    pub fn serialize<S>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.format(LOCAL_FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum DateTimeValue {
            Text(String),
            Parts(Vec<u32>),
        }

        match DateTimeValue::deserialize(deserializer)? {
            DateTimeValue::Text(s) => parse_text(&s).ok_or_else(|| {
                serde::de::Error::custom(format!("invalid date-time: {}", s))
            }),
            DateTimeValue::Parts(parts) => from_parts(&parts).ok_or_else(|| {
                serde::de::Error::custom(format!("invalid date-time array: {:?}", parts))
            }),
        }
    }

    fn parse_text(s: &str) -> Option<NaiveDateTime> {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, LOCAL_FORMAT) {
            return Some(dt);
        }
        DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.naive_utc())
    }

    fn from_parts(parts: &[u32]) -> Option<NaiveDateTime> {
        let [year, month, day, rest @ ..] = parts else {
            return None;
        };
        let hour = rest.first().copied().unwrap_or(0);
        let minute = rest.get(1).copied().unwrap_or(0);
        let second = rest.get(2).copied().unwrap_or(0);
        let nanos = rest.get(3).copied().unwrap_or(0);

        NaiveDate::from_ymd_opt(i32::try_from(*year).ok()?, *month, *day)?
            .and_hms_nano_opt(hour, minute, second, nanos)
    }
}
