use std::collections::BTreeMap;
use chrono::{DateTime, LocalResult, NaiveDateTime, Offset, TimeDelta, TimeZone, Utc};
use lazy_static::lazy_static;
use log::{debug, warn};
use scraper::{ElementRef, Html, Selector};

use crate::gateways::SmgwError;
use crate::models::{ObisCode, Reading};
use crate::obis_utils::{normalize_obis_code, validate_obis_code};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

lazy_static! {
    static ref INPUT: Selector = Selector::parse("input").unwrap();
    static ref FW_VERSION: Selector = Selector::parse("#div_fwversion").unwrap();
    static ref METER_SELECT: Selector = Selector::parse("#meterform_select_meter").unwrap();
    static ref METER_TABLE: Selector = Selector::parse("table#metervalue").unwrap();
    static ref ROW: Selector = Selector::parse("tr").unwrap();
    static ref COL_OBIS: Selector = Selector::parse("#table_metervalues_col_obis").unwrap();
    static ref COL_VALUE: Selector = Selector::parse("#table_metervalues_col_wert").unwrap();
    static ref COL_TIMESTAMP: Selector = Selector::parse("#table_metervalues_col_timestamp").unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeterForm {
    pub firmware_version: String,
    pub meter_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeterValues {
    pub readings: BTreeMap<ObisCode, Reading>,
    /// Timestamp of the last row carrying one
    pub last_timestamp: Option<DateTime<Utc>>,
}

fn text_of(element: ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// The CSRF token is the value of the first input on the login page
pub fn parse_token(html: &str) -> Result<String, SmgwError> {
    let document = Html::parse_document(html);
    document.select(&INPUT)
        .next()
        .and_then(|i| i.value().attr("value"))
        .map(|v| v.to_string())
        .ok_or(SmgwError::MissingElement("input[value]"))
}

pub fn parse_meter_form(html: &str) -> Result<MeterForm, SmgwError> {
    let document = Html::parse_document(html);

    let firmware_version = document.select(&FW_VERSION)
        .next()
        .map(text_of)
        .ok_or(SmgwError::MissingElement("#div_fwversion"))?;

    let select = document.select(&METER_SELECT)
        .next()
        .ok_or(SmgwError::MissingElement("#meterform_select_meter"))?;

    /* The first entry of the select is the meter we are reading */
    let meter_id = select.children()
        .filter_map(ElementRef::wrap)
        .next()
        .and_then(|o| o.value().attr("value"))
        .map(|v| v.to_string())
        .ok_or(SmgwError::MissingElement("#meterform_select_meter option[value]"))?;

    debug!("Found firmware {firmware_version} and meter id {meter_id}");
    Ok(MeterForm { firmware_version, meter_id })
}

fn parse_timestamp<Tz: TimeZone>(value: &str, tz: &Tz) -> Result<DateTime<Utc>, SmgwError> {
    let naive = NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT)
        .map_err(|_| SmgwError::Timestamp(value.to_string()))?;

    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => return Ok(t.with_timezone(&Utc)),
        LocalResult::None => {}
    }

    /* Wall clock time skipped by a DST switch, use the offset in effect after it */
    let offset = tz.offset_from_utc_datetime(&naive).fix();
    naive.checked_sub_signed(TimeDelta::seconds(offset.local_minus_utc().into()))
        .map(|t| Utc.from_utc_datetime(&t))
        .ok_or_else(|| SmgwError::Timestamp(value.to_string()))
}

/// Reads the meter value table. Timestamps are local time of the gateway given as `tz`.
pub fn parse_meter_values<Tz: TimeZone>(html: &str, tz: &Tz) -> Result<MeterValues, SmgwError> {
    let document = Html::parse_document(html);

    let table = document.select(&METER_TABLE)
        .next()
        .ok_or(SmgwError::MissingElement("table#metervalue"))?;

    let rows: Vec<ElementRef> = table.select(&ROW).collect();
    debug!("Found {} rows", rows.len());

    let mut readings = BTreeMap::new();
    let mut last_timestamp: Option<DateTime<Utc>> = None;

    for row in rows {
        let obis = match row.select(&COL_OBIS).next() {
            Some(o) => normalize_obis_code(&text_of(o)),
            None => continue,
        };

        if !validate_obis_code(&obis) {
            warn!("Row with OBIS cell {obis:?} is not a meter value, skipping");
            continue;
        }

        /* Consumption and feed-in come in two rows, only the first one carries the timestamp */
        if let Some(ts) = row.select(&COL_TIMESTAMP).next() {
            last_timestamp = Some(parse_timestamp(&text_of(ts), tz)?);
        }

        let timestamp = match last_timestamp {
            Some(t) => t,
            None => {
                warn!("Row {obis} has no timestamp and there is no previous one, skipping");
                continue;
            }
        };

        let value = match row.select(&COL_VALUE).next() {
            Some(v) => text_of(v),
            None => {
                warn!("Row {obis} has no value, skipping");
                continue;
            }
        };

        debug!("Parsed row {obis} = {value} at {timestamp}");
        readings.insert(obis.clone(), Reading::new(&obis, value, timestamp));
    }

    Ok(MeterValues { readings, last_timestamp })
}
