//! Legacy smart-plug wire protocol.
//!
//! Payloads are JSON encrypted with an XOR autokey cipher (initial key 171).
//! TCP frames prefix the ciphertext with its length as a big-endian `u32`;
//! UDP datagrams carry the bare ciphertext.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::device::{DeviceError, Reading, StateSnapshot};

/// Port used by the legacy protocol for both TCP and UDP.
pub const DEFAULT_PORT: u16 = 9999;

/// Initial cipher key.
const INITIAL_KEY: u8 = 171;

/// Upper bound on an accepted TCP frame.
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Encrypt `plain` with the autokey cipher.
pub fn encrypt(plain: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    plain
        .iter()
        .map(|b| {
            key ^= b;
            key
        })
        .collect()
}

/// Decrypt `cipher` with the autokey cipher.
pub fn decrypt(cipher: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    cipher
        .iter()
        .map(|c| {
            let plain = key ^ c;
            key = *c;
            plain
        })
        .collect()
}

/// Encrypt `request` and write it as one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, request: &Value) -> Result<(), DeviceError>
where
    W: AsyncWriteExt + Unpin,
{
    let payload = encrypt(&serde_json::to_vec(request)?);
    let len = u32::try_from(payload.len())
        .map_err(|_| DeviceError::Protocol("request too large".to_string()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame and decode its JSON payload.
pub async fn read_frame<R>(reader: &mut R) -> Result<Value, DeviceError>
where
    R: AsyncReadExt + Unpin,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(DeviceError::Protocol(format!("frame of {len} bytes exceeds limit")));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&decrypt(&payload))?)
}

/// Discovery query.
pub fn discovery_request() -> Value {
    json!({ "system": { "get_sysinfo": {} } })
}

/// Batched refresh query: system info, network, auto-off timer, energy
/// statistics for the device-local `today`, cloud and firmware status.
pub fn refresh_request(today: NaiveDate) -> Value {
    json!({
        "system": { "get_sysinfo": {} },
        "netif": { "get_stainfo": {} },
        "count_down": { "get_rules": {} },
        "emeter": {
            "get_realtime": {},
            "get_daystat": { "year": today.year(), "month": today.month() },
            "get_monthstat": { "year": today.year() },
        },
        "cnCloud": { "get_info": {}, "get_intl_fw_list": {} },
    })
}

/// Identity and telemetry decoded from one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub alias: String,
    pub model: String,
    pub device_id: Option<String>,
    pub state: StateSnapshot,
}

/// Decode a response to [`refresh_request`] or [`discovery_request`].
///
/// Only `system.get_sysinfo` is required; sections that the device does not
/// support are left out of the snapshot. Daily and monthly energy are looked
/// up by the calendar date of `now` in its own zone.
pub fn parse_response(response: &Value, now: DateTime<Tz>) -> Result<DeviceInfo, DeviceError> {
    let sysinfo = section(response, "system", "get_sysinfo")
        .ok_or_else(|| DeviceError::Protocol("response has no system info".to_string()))?;

    let text = |key: &str| sysinfo.get(key).and_then(Value::as_str).map(str::to_string);
    let number = |key: &str| sysinfo.get(key).and_then(Value::as_f64);

    let mut info = DeviceInfo {
        alias: text("alias").unwrap_or_default(),
        model: text("model").unwrap_or_default(),
        device_id: text("deviceId"),
        state: StateSnapshot::new(),
    };
    let state = &mut info.state;

    if let Some(relay) = number("relay_state") {
        let on = relay != 0.0;
        state.insert("state".into(), Reading::Flag(on));
        if on && let Some(since) = number("on_time")
            .filter(|secs| *secs >= 0.0)
            .and_then(|secs| seconds_before(now, secs)) {
            state.insert("on_since".into(), Reading::Timestamp(since));
        }
    }
    if let Some(led_off) = number("led_off") {
        state.insert("led".into(), Reading::Flag(led_off == 0.0));
    }
    if let Some(rssi) = number("rssi") {
        state.insert("rssi".into(), Reading::Number(rssi));
        state.insert("signal_level".into(), Reading::Number(signal_level(rssi)));
    }
    for (from, to) in [
        ("sw_ver", "current_firmware_version"),
        ("hw_ver", "hardware_version"),
        ("mac", "mac"),
    ] {
        if let Some(value) = text(from) {
            state.insert(to.into(), Reading::Text(value));
        }
    }
    if let Some(updating) = number("updating") {
        state.insert("updating".into(), Reading::Flag(updating != 0.0));
    }

    if let Some(ssid) = section(response, "netif", "get_stainfo")
        .and_then(|stainfo| stainfo.get("ssid"))
        .and_then(Value::as_str)
    {
        state.insert("ssid".into(), Reading::from(ssid));
    }

    // Only the first countdown rule is reported.
    if let Some(rule) = section(response, "count_down", "get_rules")
        .and_then(|rules| rules.get("rule_list"))
        .and_then(Value::as_array)
        .and_then(|rules| rules.first())
    {
        let enabled = rule.get("enable").and_then(Value::as_f64).map(|e| e != 0.0);
        if let Some(enabled) = enabled {
            state.insert("auto_off_enabled".into(), Reading::Flag(enabled));
        }
        if let Some(delay) = rule.get("delay").and_then(Value::as_f64) {
            state.insert("auto_off_minutes".into(), Reading::Number(delay / 60.0));
        }
        if enabled == Some(true)
            && let Some(at) = rule
                .get("remain")
                .and_then(Value::as_f64)
                .and_then(|remain| seconds_before(now, -remain))
        {
            state.insert("auto_off_at".into(), Reading::Timestamp(at));
        }
    }

    if let Some(realtime) = section(response, "emeter", "get_realtime") {
        // Newer firmware reports milli-units (mW, mV, mA, Wh), older firmware
        // base units (W, V, A, kWh).
        let scaled = |milli: &str, base: &str| {
            realtime
                .get(milli)
                .and_then(Value::as_f64)
                .map(|v| v / 1000.0)
                .or_else(|| realtime.get(base).and_then(Value::as_f64))
        };
        for (key, milli, base) in [
            ("current_consumption", "power_mw", "power"),
            ("voltage", "voltage_mv", "voltage"),
            ("current", "current_ma", "current"),
            ("consumption_total", "total_wh", "total"),
        ] {
            if let Some(value) = scaled(milli, base) {
                state.insert(key.into(), Reading::Number(value));
            }
        }
    }

    if let Some(daystat) = section(response, "emeter", "get_daystat")
        && let Some(kwh) = energy_for(daystat, "day_list", "day", now.day())
    {
        state.insert("consumption_today".into(), Reading::Number(kwh));
    }
    if let Some(monthstat) = section(response, "emeter", "get_monthstat")
        && let Some(kwh) = energy_for(monthstat, "month_list", "month", now.month())
    {
        state.insert("consumption_this_month".into(), Reading::Number(kwh));
    }

    if let Some(cloud) = section(response, "cnCloud", "get_info")
        && let Some(connected) = cloud.get("cld_connection").and_then(Value::as_f64)
    {
        state.insert("cloud_connection".into(), Reading::Flag(connected != 0.0));
    }
    if let Some(firmware) = section(response, "cnCloud", "get_intl_fw_list")
        .and_then(|list| list.get("fw_list"))
        .and_then(Value::as_array)
    {
        state.insert("update_available".into(), Reading::Flag(!firmware.is_empty()));
        if let Some(version) = firmware
            .first()
            .and_then(|fw| fw.get("fwVer"))
            .and_then(Value::as_str)
        {
            state.insert("available_firmware_version".into(), Reading::from(version));
        }
    }

    Ok(info)
}

/// `response[module][method]`, unless the device reported an error for it.
fn section<'a>(response: &'a Value, module: &str, method: &str) -> Option<&'a Value> {
    let value = response.get(module)?.get(method)?;
    match value.get("err_code").and_then(Value::as_i64) {
        Some(0) | None => Some(value),
        Some(code) => {
            tracing::debug!(
                module,
                method,
                err_code = code,
                err_msg = ?value.get("err_msg"),
                "Device does not support query"
            );
            None
        }
    }
}

/// The UTC instant `secs` seconds before `now`, or `None` when the reading is
/// not finite or lands outside the representable range.
fn seconds_before(now: DateTime<Tz>, secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    // The float-to-int cast saturates, so only the subtraction can overflow.
    let offset = ChronoDuration::try_milliseconds((secs * 1000.0) as i64)?;
    now.with_timezone(&Utc).checked_sub_signed(offset)
}

/// Energy in kWh for the entry of `list` whose `field` equals `wanted`.
fn energy_for(stats: &Value, list: &str, field: &str, wanted: u32) -> Option<f64> {
    stats
        .get(list)?
        .as_array()?
        .iter()
        .find(|entry| entry.get(field).and_then(Value::as_u64) == Some(u64::from(wanted)))
        .and_then(|entry| {
            entry
                .get("energy_wh")
                .and_then(Value::as_f64)
                .map(|wh| wh / 1000.0)
                .or_else(|| entry.get("energy").and_then(Value::as_f64))
        })
}

/// Signal bars (0 to 3) from RSSI in dBm.
fn signal_level(rssi: f64) -> f64 {
    match rssi {
        r if r >= -50.0 => 3.0,
        r if r >= -67.0 => 2.0,
        r if r >= -80.0 => 1.0,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America::Denver;

    fn now() -> DateTime<Tz> {
        chrono_tz::UTC.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    fn sysinfo(fields: Value) -> Value {
        json!({ "system": { "get_sysinfo": fields } })
    }

    fn sample_response() -> Value {
        json!({
            "system": { "get_sysinfo": {
                "alias": "Desk Lamp",
                "model": "HS110(US)",
                "deviceId": "8006ABCDEF",
                "relay_state": 1,
                "on_time": 3600,
                "led_off": 0,
                "rssi": -55,
                "sw_ver": "1.5.6 Build 191125 Rel.083657",
                "hw_ver": "4.0",
                "mac": "AA:BB:CC:DD:EE:FF",
                "updating": 0,
            }},
            "netif": { "get_stainfo": { "ssid": "HomeNet", "rssi": -55, "err_code": 0 } },
            "count_down": { "get_rules": { "rule_list": [
                { "id": "1", "enable": 1, "delay": 1800, "act": 0, "remain": 900 },
            ], "err_code": 0 } },
            "emeter": {
                "get_realtime": {
                    "power_mw": 12500, "voltage_mv": 121000, "current_ma": 110, "total_wh": 4200, "err_code": 0
                },
                "get_daystat": { "day_list": [
                    { "year": 2024, "month": 6, "day": 14, "energy_wh": 900 },
                    { "year": 2024, "month": 6, "day": 15, "energy_wh": 300 },
                ], "err_code": 0 },
                "get_monthstat": { "month_list": [
                    { "year": 2024, "month": 6, "energy": 7.5 },
                ], "err_code": 0 },
            },
            "cnCloud": {
                "get_info": { "cld_connection": 1, "err_code": 0 },
                "get_intl_fw_list": { "fw_list": [
                    { "fwVer": "1.5.10 Build 191125 Rel.083657", "fwType": 2 },
                ], "err_code": 0 },
            },
        })
    }

    #[test]
    fn test_cipher_known_vector() {
        // First byte: 171 ^ '{' (0x7b) = 0xd0
        let cipher = encrypt(br#"{"system":{}}"#);
        assert_eq!(cipher[0], 0xd0);
        assert_eq!(decrypt(&cipher), br#"{"system":{}}"#);
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let request = discovery_request();
        write_frame(&mut client, &request).await.unwrap();
        assert_eq!(read_frame(&mut server).await.unwrap(), request);
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_length() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(_)));
    }

    #[test]
    fn test_parse_response_full() {
        let info = parse_response(&sample_response(), now()).unwrap();
        assert_eq!(info.alias, "Desk Lamp");
        assert_eq!(info.model, "HS110(US)");
        assert_eq!(info.device_id.as_deref(), Some("8006ABCDEF"));

        let state = &info.state;
        assert_eq!(state["state"], Reading::Flag(true));
        assert_eq!(state["led"], Reading::Flag(true));
        assert_eq!(state["rssi"], Reading::Number(-55.0));
        assert_eq!(state["signal_level"], Reading::Number(2.0));
        assert_eq!(
            state["on_since"],
            Reading::Timestamp(Utc.with_ymd_and_hms(2024, 6, 15, 11, 0, 0).unwrap())
        );
        assert_eq!(state["current_consumption"], Reading::Number(12.5));
        assert_eq!(state["voltage"], Reading::Number(121.0));
        assert_eq!(state["current"], Reading::Number(0.11));
        assert_eq!(state["consumption_total"], Reading::Number(4.2));
        assert_eq!(state["consumption_today"], Reading::Number(0.3));
        assert_eq!(state["consumption_this_month"], Reading::Number(7.5));
        assert_eq!(state["cloud_connection"], Reading::Flag(true));
        assert_eq!(
            state["current_firmware_version"],
            Reading::Text("1.5.6 Build 191125 Rel.083657".into())
        );
        assert_eq!(state["ssid"], Reading::from("HomeNet"));
        assert_eq!(state["auto_off_enabled"], Reading::Flag(true));
        assert_eq!(state["auto_off_minutes"], Reading::Number(30.0));
        assert_eq!(
            state["auto_off_at"],
            Reading::Timestamp(Utc.with_ymd_and_hms(2024, 6, 15, 12, 15, 0).unwrap())
        );
        assert_eq!(state["update_available"], Reading::Flag(true));
        assert_eq!(
            state["available_firmware_version"],
            Reading::from("1.5.10 Build 191125 Rel.083657")
        );
    }

    #[test]
    fn test_refresh_request_queries_every_section() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        let request = refresh_request(today);
        assert_eq!(request["emeter"]["get_daystat"], json!({ "year": 2024, "month": 6 }));
        assert_eq!(request["emeter"]["get_monthstat"], json!({ "year": 2024 }));
        for (module, method) in [
            ("system", "get_sysinfo"),
            ("netif", "get_stainfo"),
            ("count_down", "get_rules"),
            ("cnCloud", "get_info"),
            ("cnCloud", "get_intl_fw_list"),
        ] {
            assert!(request[module].get(method).is_some(), "{module}.{method}");
        }
    }

    #[test]
    fn test_on_time_out_of_range_is_skipped() {
        for on_time in [json!(1e18), json!(-5), json!(u64::MAX)] {
            let response = sysinfo(json!({ "relay_state": 1, "on_time": on_time }));
            let info = parse_response(&response, now()).unwrap();
            assert_eq!(info.state["state"], Reading::Flag(true));
            assert!(!info.state.contains_key("on_since"), "on_time {on_time}");
        }
    }

    #[test]
    fn test_energy_stats_use_local_date() {
        // 03:00 UTC on July 1 is still the evening of June 30 in Denver.
        let at = chrono_tz::UTC
            .with_ymd_and_hms(2024, 7, 1, 3, 0, 0)
            .unwrap()
            .with_timezone(&Denver);
        let response = json!({
            "system": { "get_sysinfo": { "relay_state": 0 } },
            "emeter": {
                "get_daystat": { "day_list": [
                    { "year": 2024, "month": 6, "day": 30, "energy_wh": 1200 },
                    { "year": 2024, "month": 6, "day": 1, "energy_wh": 50 },
                ]},
                "get_monthstat": { "month_list": [
                    { "year": 2024, "month": 6, "energy_wh": 31000 },
                    { "year": 2024, "month": 7, "energy_wh": 10 },
                ]},
            },
        });
        let info = parse_response(&response, at).unwrap();
        assert_eq!(info.state["consumption_today"], Reading::Number(1.2));
        assert_eq!(info.state["consumption_this_month"], Reading::Number(31.0));
    }

    #[test]
    fn test_auto_off_disabled_has_no_deadline() {
        let mut response = sysinfo(json!({ "relay_state": 1 }));
        response["count_down"] = json!({ "get_rules": { "rule_list": [
            { "enable": 0, "delay": 600, "remain": 600 },
        ]}});
        let info = parse_response(&response, now()).unwrap();
        assert_eq!(info.state["auto_off_enabled"], Reading::Flag(false));
        assert_eq!(info.state["auto_off_minutes"], Reading::Number(10.0));
        assert!(!info.state.contains_key("auto_off_at"));
    }

    #[test]
    fn test_empty_firmware_list_means_no_update() {
        let mut response = sysinfo(json!({ "relay_state": 0 }));
        response["cnCloud"] = json!({ "get_intl_fw_list": { "fw_list": [], "err_code": 0 } });
        let info = parse_response(&response, now()).unwrap();
        assert_eq!(info.state["update_available"], Reading::Flag(false));
        assert!(!info.state.contains_key("available_firmware_version"));
    }

    #[test]
    fn test_parse_response_skips_unsupported_modules() {
        let response = json!({
            "system": { "get_sysinfo": { "alias": "Plug", "model": "HS100(US)", "relay_state": 0 } },
            "emeter": { "err_code": -1, "err_msg": "module not support" },
            "cnCloud": { "get_info": { "err_code": -2, "err_msg": "member not support" } },
        });
        let info = parse_response(&response, now()).unwrap();
        assert_eq!(info.state["state"], Reading::Flag(false));
        assert!(!info.state.contains_key("on_since"));
        assert!(!info.state.contains_key("current_consumption"));
        assert!(!info.state.contains_key("cloud_connection"));
    }

    #[test]
    fn test_parse_response_requires_sysinfo() {
        let err = parse_response(&json!({ "emeter": {} }), now()).unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(_)));
    }

    #[test]
    fn test_signal_level_bands() {
        assert_eq!(signal_level(-40.0), 3.0);
        assert_eq!(signal_level(-67.0), 2.0);
        assert_eq!(signal_level(-75.0), 1.0);
        assert_eq!(signal_level(-90.0), 0.0);
    }
}
