//! Wall-clock stamps used by the state-update and attribute-update
//! handlers (spec §4.9): RFC-3339 UTC for `Device::last_online`,
//! milliseconds-since-epoch for `BaseMessage::timestamp`.

use chrono::Utc;

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
