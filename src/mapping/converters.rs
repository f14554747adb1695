//! Pure, side-effect-free value converters used by mapping templates
//! and extraction expressions.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde_json::Value;

use crate::error::{EodagError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Converter {
    ToTimestampMilliseconds,
    ToIsoUtcDatetime,
    ToIsoUtcDatetimeFromMilliseconds,
    ToIsoDate,
    ToWkt,
    ToBoundsLists,
    ToGeojson,
    RemoveExtension,
    ReplaceStr { pattern: String, replacement: String },
    SliceStr { start: isize, end: Option<isize> },
    GetGroupName { pattern: String, group: String },
}

impl Converter {
    /// Parses a `name(arg1,arg2)` converter call.
    pub fn parse(spec: &str) -> std::result::Result<Converter, String> {
        let spec = spec.trim();
        let (name, args_str) = match spec.find('(') {
            Some(open) => {
                let close = spec.rfind(')').ok_or_else(|| format!("unterminated converter args in {spec:?}"))?;
                (&spec[..open], &spec[open + 1..close])
            }
            None => (spec, ""),
        };
        let args: Vec<&str> = if args_str.is_empty() {
            vec![]
        } else {
            args_str.split(',').map(str::trim).collect()
        };
        match name {
            "to_timestamp_milliseconds" => Ok(Converter::ToTimestampMilliseconds),
            "to_iso_utc_datetime" => Ok(Converter::ToIsoUtcDatetime),
            "to_iso_utc_datetime_from_milliseconds" => Ok(Converter::ToIsoUtcDatetimeFromMilliseconds),
            "to_iso_date" => Ok(Converter::ToIsoDate),
            "to_wkt" => Ok(Converter::ToWkt),
            "to_bounds_lists" => Ok(Converter::ToBoundsLists),
            "to_geojson" => Ok(Converter::ToGeojson),
            "remove_extension" => Ok(Converter::RemoveExtension),
            "replace_str" => {
                let [pattern, replacement] = args[..] else {
                    return Err(format!("replace_str expects 2 args, got {args:?}"));
                };
                Ok(Converter::ReplaceStr { pattern: pattern.to_string(), replacement: replacement.to_string() })
            }
            "slice_str" => {
                let start = args.first().and_then(|s| s.parse().ok()).unwrap_or(0);
                let end = args.get(1).and_then(|s| s.parse().ok());
                Ok(Converter::SliceStr { start, end })
            }
            "get_group_name" => {
                let [pattern, group] = args[..] else {
                    return Err(format!("get_group_name expects 2 args, got {args:?}"));
                };
                Ok(Converter::GetGroupName { pattern: pattern.to_string(), group: group.to_string() })
            }
            unknown => Err(format!("unknown converter {unknown:?}")),
        }
    }

    pub fn to_source(&self) -> String {
        match self {
            Converter::ToTimestampMilliseconds => "to_timestamp_milliseconds".to_string(),
            Converter::ToIsoUtcDatetime => "to_iso_utc_datetime".to_string(),
            Converter::ToIsoUtcDatetimeFromMilliseconds => "to_iso_utc_datetime_from_milliseconds".to_string(),
            Converter::ToIsoDate => "to_iso_date".to_string(),
            Converter::ToWkt => "to_wkt".to_string(),
            Converter::ToBoundsLists => "to_bounds_lists".to_string(),
            Converter::ToGeojson => "to_geojson".to_string(),
            Converter::RemoveExtension => "remove_extension".to_string(),
            Converter::ReplaceStr { pattern, replacement } => format!("replace_str({pattern},{replacement})"),
            Converter::SliceStr { start, end } => match end {
                Some(end) => format!("slice_str({start},{end})"),
                None => format!("slice_str({start})"),
            },
            Converter::GetGroupName { pattern, group } => format!("get_group_name({pattern},{group})"),
        }
    }

    pub fn apply(&self, value: Value) -> Result<Value> {
        match self {
            Converter::ToTimestampMilliseconds => {
                let datetime = parse_rfc3339_like(value_as_str(&value)?)?;
                Ok(Value::from(datetime.timestamp_millis()))
            }
            Converter::ToIsoUtcDatetime => {
                let datetime = parse_rfc3339_like(value_as_str(&value)?)?;
                Ok(Value::String(datetime.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)))
            }
            Converter::ToIsoUtcDatetimeFromMilliseconds => {
                let millis = value_as_i64(&value)?;
                let datetime = Utc
                    .timestamp_millis_opt(millis)
                    .single()
                    .ok_or_else(|| EodagError::validation(format!("invalid millisecond timestamp {millis}")))?;
                Ok(Value::String(datetime.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)))
            }
            Converter::ToIsoDate => {
                let s = value_as_str(&value)?;
                let date = s.get(..10).unwrap_or(s);
                NaiveDate::parse_from_str(date, "%Y-%m-%d")
                    .map_err(|e| EodagError::validation(format!("invalid date {s:?}: {e}")))?;
                Ok(Value::String(date.to_string()))
            }
            Converter::ToWkt => {
                // Accepts a GeoJSON-shaped value and emits its WKT string.
                let geojson: geojson::GeoJson =
                    serde_json::from_value(value.clone()).map_err(|e| EodagError::validation(format!("not valid GeoJSON: {e}")))?;
                let geometry: geo_types::Geometry<f64> =
                    geojson.try_into().map_err(|e: geojson::Error| EodagError::validation(e.to_string()))?;
                use wkt::ToWkt;
                Ok(Value::String(geometry.wkt_string()))
            }
            Converter::ToBoundsLists => {
                let bbox = value.as_array().ok_or_else(|| EodagError::validation("to_bounds_lists expects an array"))?;
                let floats: Vec<f64> = bbox.iter().filter_map(|v| v.as_f64()).collect();
                if floats.len() != 4 {
                    return Err(EodagError::validation("to_bounds_lists expects [minx, miny, maxx, maxy]"));
                }
                Ok(serde_json::json!([[floats[0], floats[1]], [floats[2], floats[3]]]))
            }
            Converter::ToGeojson => {
                use wkt::TryFromWkt;
                let s = value_as_str(&value)?;
                let geom = geo_types::Geometry::<f64>::try_from_wkt_str(s)
                    .map_err(|e| EodagError::validation(format!("invalid WKT {s:?}: {e}")))?;
                let geojson_geom = geojson::Geometry::from(&geom);
                serde_json::to_value(geojson_geom).map_err(|e| EodagError::validation(e.to_string()))
            }
            Converter::RemoveExtension => {
                let s = value_as_str(&value)?;
                let stripped = match s.rfind('.') {
                    Some(i) => &s[..i],
                    None => s,
                };
                Ok(Value::String(stripped.to_string()))
            }
            Converter::ReplaceStr { pattern, replacement } => {
                let s = value_as_str(&value)?;
                let re = Regex::new(pattern).map_err(|e| EodagError::misconfigured("mapping", format!("bad regex {pattern:?}: {e}")))?;
                Ok(Value::String(re.replace_all(s, replacement.as_str()).into_owned()))
            }
            Converter::SliceStr { start, end } => {
                let s = value_as_str(&value)?;
                let chars: Vec<char> = s.chars().collect();
                let len = chars.len() as isize;
                let norm = |i: isize| -> usize {
                    let i = if i < 0 { (len + i).max(0) } else { i.min(len) };
                    i as usize
                };
                let start_idx = norm(*start);
                let end_idx = end.map(norm).unwrap_or(chars.len());
                let end_idx = end_idx.max(start_idx);
                Ok(Value::String(chars[start_idx..end_idx].iter().collect()))
            }
            Converter::GetGroupName { pattern, group } => {
                let s = value_as_str(&value)?;
                let re = Regex::new(pattern).map_err(|e| EodagError::misconfigured("mapping", format!("bad regex {pattern:?}: {e}")))?;
                let captures = re
                    .captures(s)
                    .ok_or_else(|| EodagError::validation(format!("pattern {pattern:?} did not match {s:?}")))?;
                let matched = captures
                    .name(group)
                    .ok_or_else(|| EodagError::misconfigured("mapping", format!("no named group {group:?} in pattern")))?;
                Ok(Value::String(matched.as_str().to_string()))
            }
        }
    }
}

fn value_as_str(value: &Value) -> Result<&str> {
    value.as_str().ok_or_else(|| EodagError::validation(format!("expected a string value, got {value}")))
}

fn value_as_i64(value: &Value) -> Result<i64> {
    value.as_i64().ok_or_else(|| EodagError::validation(format!("expected an integer value, got {value}")))
}

fn parse_rfc3339_like(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|d| Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap()))
        })
        .map_err(|e| EodagError::validation(format!("invalid RFC 3339 datetime {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_roundtrips_through_iso() {
        let original = "2024-01-02T03:04:05Z";
        let ms = Converter::ToTimestampMilliseconds.apply(Value::String(original.to_string())).unwrap();
        let back = Converter::ToIsoUtcDatetimeFromMilliseconds.apply(ms).unwrap();
        assert_eq!(back.as_str().unwrap(), original);
    }

    #[test]
    fn remove_extension_strips_last_dot_segment() {
        let v = Converter::RemoveExtension.apply(Value::String("file.tar.gz".to_string())).unwrap();
        assert_eq!(v.as_str().unwrap(), "file.tar");
    }

    #[test]
    fn slice_str_supports_negative_indices() {
        let v = Converter::SliceStr { start: -3, end: None }.apply(Value::String("hello".to_string())).unwrap();
        assert_eq!(v.as_str().unwrap(), "llo");
    }

    #[test]
    fn get_group_name_extracts_named_capture() {
        let conv = Converter::GetGroupName { pattern: r"R(?P<res>\d+)".to_string(), group: "res".to_string() };
        let v = conv.apply(Value::String("tiles/R60/x.jp2".to_string())).unwrap();
        assert_eq!(v.as_str().unwrap(), "60");
    }

    #[test]
    fn unknown_converter_fails_the_mapping() {
        assert!(Converter::parse("not_a_real_converter").is_err());
    }

    #[test]
    fn to_bounds_lists_shapes_a_bbox_array() {
        let v = Converter::ToBoundsLists.apply(serde_json::json!([0.0, 0.0, 1.0, 1.0])).unwrap();
        assert_eq!(v, serde_json::json!([[0.0, 0.0], [1.0, 1.0]]));
    }
}
