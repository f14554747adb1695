//! The bidirectional metadata mapping engine: translates between the
//! canonical property/query vocabulary and a provider's wire vocabulary.
//!
//! Mappings are parsed once from YAML into the [`Mapping`] AST (see the
//! "mapping engine -> typed DSL" design note); plugins only ever see
//! typed nodes, never raw strings interpreted by ad hoc regex at call
//! time.

pub mod converters;

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EodagError, Result};

use converters::Converter;

/// A single reference inside a template string: either a literal chunk
/// or a `{placeholder#converter(args)}` substitution.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Literal(String),
    Placeholder { property: String, converters: Vec<Converter> },
}

/// One property's mapping entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Mapping {
    /// Non-queryable constant string, used only as a literal in responses
    /// or requests.
    Const(String),
    /// Extraction-only: a JSONPath or XPath expression plus converters
    /// applied to the extracted value(s).
    Extract { path: String, converters: Vec<Converter> },
    /// Queryable: a pair of (query-format template, extraction
    /// expression).
    Queryable { query_format: String, extract: Box<Mapping> },
    /// A template string referring to other properties, to be
    /// interpolated in a second pass after primary extraction.
    Template(Vec<TemplatePart>),
}

impl Serialize for Mapping {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_source())
    }
}

impl<'de> Deserialize<'de> for Mapping {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawMapping::deserialize(deserializer)?;
        Mapping::parse_raw(raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawMapping {
    Pair([String; 2]),
    Single(String),
}

impl Mapping {
    fn parse_raw(raw: RawMapping) -> std::result::Result<Mapping, String> {
        match raw {
            RawMapping::Pair([query_format, extract_expr]) => {
                let extract = Mapping::parse_single(&extract_expr)?;
                Ok(Mapping::Queryable { query_format, extract: Box::new(extract) })
            }
            RawMapping::Single(s) => Mapping::parse_single(&s),
        }
    }

    pub fn parse_single(s: &str) -> std::result::Result<Mapping, String> {
        if s.contains('{') && s.contains('}') {
            return Ok(Mapping::Template(parse_template(s)?));
        }
        if looks_like_path(s) {
            let (path, converters) = split_converters(s)?;
            return Ok(Mapping::Extract { path, converters });
        }
        Ok(Mapping::Const(s.to_string()))
    }

    /// Reconstructs a source-level string for this mapping, used by
    /// `Serialize` and by debug output. Round-trips through `parse_single`.
    pub fn to_source(&self) -> String {
        match self {
            Mapping::Const(s) => s.clone(),
            Mapping::Extract { path, converters } => {
                let mut s = path.clone();
                for c in converters {
                    s.push('#');
                    s.push_str(&c.to_source());
                }
                s
            }
            Mapping::Template(parts) => parts
                .iter()
                .map(|p| match p {
                    TemplatePart::Literal(l) => l.clone(),
                    TemplatePart::Placeholder { property, converters } => {
                        let mut s = format!("{{{property}");
                        for c in converters {
                            s.push('#');
                            s.push_str(&c.to_source());
                        }
                        s.push('}');
                        s
                    }
                })
                .collect(),
            Mapping::Queryable { extract, .. } => extract.to_source(),
        }
    }

    pub fn is_queryable(&self) -> bool {
        matches!(self, Mapping::Queryable { .. })
    }
}

fn looks_like_path(s: &str) -> bool {
    s.starts_with('$') || s.starts_with('/') || s.starts_with("//")
}

fn split_converters(s: &str) -> std::result::Result<(String, Vec<Converter>), String> {
    let mut parts = s.split('#');
    let path = parts.next().unwrap_or_default().to_string();
    let converters = parts.map(Converter::parse).collect::<std::result::Result<Vec<_>, _>>()?;
    Ok((path, converters))
}

fn parse_template(s: &str) -> std::result::Result<Vec<TemplatePart>, String> {
    let mut parts = Vec::new();
    let mut rest = s;
    while let Some(open) = rest.find('{') {
        if open > 0 {
            parts.push(TemplatePart::Literal(rest[..open].to_string()));
        }
        let Some(close) = rest[open..].find('}') else {
            return Err(format!("unterminated placeholder in template {s:?}"));
        };
        let inner = &rest[open + 1..open + close];
        let mut segments = inner.split('#');
        let property = segments.next().unwrap_or_default().to_string();
        let converters = segments.map(Converter::parse).collect::<std::result::Result<Vec<_>, _>>()?;
        parts.push(TemplatePart::Placeholder { property, converters });
        rest = &rest[open + close + 1..];
    }
    if !rest.is_empty() {
        parts.push(TemplatePart::Literal(rest.to_string()));
    }
    Ok(parts)
}

/// Result of evaluating a JSONPath-like expression: zero matches is
/// `NotAvailable`, one match is the bare value, multiple matches is the
/// list — matching the response-extraction contract.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    NotAvailable,
    One(Value),
    Many(Vec<Value>),
}

impl Extracted {
    pub fn into_value(self) -> Value {
        match self {
            Extracted::NotAvailable => Value::Null,
            Extracted::One(v) => v,
            Extracted::Many(vs) => Value::Array(vs),
        }
    }
}

/// Minimal dotted/bracket JSONPath subset sufficient for provider
/// mappings: `$.a.b[0].c`, `$.features[*].properties.id`. No JSONPath
/// crate appears anywhere in the retrieval pack, so this is hand-rolled
/// and deliberately small (see DESIGN.md) rather than pulling in an
/// unfamiliar dependency for a handful of operators.
pub fn eval_jsonpath(path: &str, doc: &Value) -> Extracted {
    let path = path.trim_start_matches('$').trim_start_matches('.');
    if path.is_empty() {
        return Extracted::One(doc.clone());
    }
    let mut current: Vec<Value> = vec![doc.clone()];
    for segment in split_path_segments(path) {
        let mut next = Vec::new();
        for value in current {
            match &segment {
                PathSegment::Key(key) => {
                    if let Some(v) = value.get(key) {
                        next.push(v.clone());
                    }
                }
                PathSegment::Index(i) => {
                    if let Some(v) = value.get(*i) {
                        next.push(v.clone());
                    }
                }
                PathSegment::Wildcard => {
                    if let Some(array) = value.as_array() {
                        next.extend(array.iter().cloned());
                    } else if let Some(obj) = value.as_object() {
                        next.extend(obj.values().cloned());
                    }
                }
            }
        }
        current = next;
    }
    match current.len() {
        0 => Extracted::NotAvailable,
        1 => Extracted::One(current.into_iter().next().unwrap()),
        _ => Extracted::Many(current),
    }
}

enum PathSegment {
    Key(String),
    Index(usize),
    Wildcard,
}

fn split_path_segments(path: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    for dotted in path.split('.') {
        let mut rest = dotted;
        while let Some(bracket) = rest.find('[') {
            if bracket > 0 {
                segments.push(PathSegment::Key(rest[..bracket].to_string()));
            }
            let Some(end) = rest[bracket..].find(']') else { break };
            let inner = &rest[bracket + 1..bracket + end];
            if inner == "*" {
                segments.push(PathSegment::Wildcard);
            } else if let Ok(i) = inner.parse::<usize>() {
                segments.push(PathSegment::Index(i));
            }
            rest = &rest[bracket + end + 1..];
        }
        if !rest.is_empty() {
            if rest == "*" {
                segments.push(PathSegment::Wildcard);
            } else {
                segments.push(PathSegment::Key(rest.to_string()));
            }
        }
    }
    segments
}

/// Evaluates an XPath-subset expression against a parsed XML tree,
/// rebinding empty-namespace prefixes to a synthetic `ns` prefix so
/// default-namespaced elements remain reachable (per the wire
/// compatibility requirement). Implemented over `quick_xml`'s event
/// stream rather than a full XPath engine — see DESIGN.md.
pub fn eval_xpath(path: &str, xml: &str) -> Result<Extracted> {
    use quick_xml::events::Event;
    use quick_xml::reader::Reader;

    let normalized = path.trim_start_matches('/').replace("ns:", "");
    let target_segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
    if target_segments.is_empty() {
        return Ok(Extracted::NotAvailable);
    }

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut stack: Vec<String> = Vec::new();
    let mut matches = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = local_name(&e.name().as_ref().to_vec());
                stack.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = local_name(&e.name().as_ref().to_vec());
                stack.push(name);
                if stack_matches(&stack, &target_segments) {
                    matches.push(Value::String(String::new()));
                }
                stack.pop();
            }
            Ok(Event::Text(t)) => {
                if stack_matches(&stack, &target_segments) {
                    if let Ok(text) = t.unescape() {
                        matches.push(Value::String(text.into_owned()));
                    }
                }
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(EodagError::misconfigured("xpath", format!("malformed XML: {e}")));
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(match matches.len() {
        0 => Extracted::NotAvailable,
        1 => Extracted::One(matches.into_iter().next().unwrap()),
        _ => Extracted::Many(matches),
    })
}

fn local_name(qualified: &[u8]) -> String {
    let s = String::from_utf8_lossy(qualified);
    s.rsplit(':').next().unwrap_or(&s).to_string()
}

fn stack_matches(stack: &[String], target: &[&str]) -> bool {
    if stack.len() < target.len() {
        return false;
    }
    let offset = stack.len() - target.len();
    stack[offset..].iter().zip(target.iter()).all(|(a, b)| a == b)
}

/// The mapping engine proper: owns a property -> [`Mapping`] table and
/// performs request formatting and response extraction.
#[derive(Debug, Clone, Default)]
pub struct MappingEngine {
    pub mapping: BTreeMap<String, Mapping>,
}

impl MappingEngine {
    pub fn new(mapping: BTreeMap<String, Mapping>) -> Self {
        MappingEngine { mapping }
    }

    /// Queryables recognized by this engine: any entry whose mapping is
    /// a pair is queryable under its canonical name.
    pub fn queryables(&self) -> Vec<&str> {
        self.mapping
            .iter()
            .filter(|(_, m)| m.is_queryable())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Renders query parameters for the given user kwargs, applying
    /// placeholder substitution against the query-format templates of
    /// queryable entries.
    pub fn format_query(&self, kwargs: &BTreeMap<String, Value>) -> Result<BTreeMap<String, String>> {
        let mut rendered = BTreeMap::new();
        for (name, mapping) in &self.mapping {
            let Mapping::Queryable { query_format, .. } = mapping else { continue };
            if let Some(value) = kwargs.get(name) {
                let formatted = render_query_format(query_format, name, value)?;
                rendered.insert(name.clone(), formatted);
            }
        }
        Ok(rendered)
    }

    /// Extracts a single property from a parsed JSON document, applying
    /// converters. Idempotent: re-running on the same document yields
    /// the same [`Value`].
    pub fn extract_json(&self, name: &str, doc: &Value) -> Result<Value> {
        let Some(mapping) = self.mapping.get(name) else {
            return Ok(Value::Null);
        };
        self.extract_json_mapping(mapping, doc)
    }

    fn extract_json_mapping(&self, mapping: &Mapping, doc: &Value) -> Result<Value> {
        match mapping {
            Mapping::Const(s) => Ok(Value::String(s.clone())),
            Mapping::Extract { path, converters } => {
                let extracted = eval_jsonpath(path, doc).into_value();
                apply_converters(extracted, converters)
            }
            Mapping::Queryable { extract, .. } => self.extract_json_mapping(extract, doc),
            Mapping::Template(_) => Ok(Value::Null), // resolved in second pass
        }
    }

    /// Extracts every mapped property from a JSON document in one pass,
    /// then runs the second pass resolving [`Mapping::Template`] entries
    /// that reference other already-resolved properties.
    pub fn extract_all_json(&self, doc: &Value) -> Result<BTreeMap<String, Value>> {
        let mut result = BTreeMap::new();
        for (name, mapping) in &self.mapping {
            if matches!(mapping, Mapping::Template(_)) {
                continue;
            }
            result.insert(name.clone(), self.extract_json_mapping(mapping, doc)?);
        }
        for (name, mapping) in &self.mapping {
            let Mapping::Template(parts) = mapping else { continue };
            let rendered = render_template_parts(parts, &result)?;
            result.insert(name.clone(), Value::String(rendered));
        }
        Ok(result)
    }

    pub fn extract_all_xml(&self, xml: &str) -> Result<BTreeMap<String, Value>> {
        let mut result = BTreeMap::new();
        for (name, mapping) in &self.mapping {
            let path_mapping = match mapping {
                Mapping::Extract { .. } => mapping,
                Mapping::Queryable { extract, .. } => extract.as_ref(),
                _ => continue,
            };
            if let Mapping::Extract { path, converters } = path_mapping {
                let extracted = eval_xpath(path, xml)?.into_value();
                result.insert(name.clone(), apply_converters(extracted, converters)?);
            }
        }
        Ok(result)
    }

    /// Metadata auto-discovery: given a regex and a JSONPath to a
    /// container, extracts unmapped keys matching the pattern.
    pub fn autodiscover(&self, container_path: &str, pattern: &Regex, doc: &Value) -> BTreeMap<String, Value> {
        let already_mapped: std::collections::HashSet<&str> = self.mapping.keys().map(String::as_str).collect();
        let container = eval_jsonpath(container_path, doc).into_value();
        let mut discovered = BTreeMap::new();
        if let Some(obj) = container.as_object() {
            for (key, value) in obj {
                if pattern.is_match(key) && !already_mapped.contains(key.as_str()) {
                    discovered.insert(key.clone(), value.clone());
                }
            }
        }
        discovered
    }
}

fn render_query_format(template: &str, property_name: &str, value: &Value) -> Result<String> {
    let as_str = value_to_query_string(value);
    if template.contains('{') {
        let parts = parse_template(template).map_err(EodagError::validation)?;
        render_template_parts(
            &parts,
            &BTreeMap::from([(property_name.to_string(), Value::String(as_str))]),
        )
    } else {
        Ok(template.replace("{}", &as_str))
    }
}

fn value_to_query_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_template_parts(parts: &[TemplatePart], resolved: &BTreeMap<String, Value>) -> Result<String> {
    let mut out = String::new();
    for part in parts {
        match part {
            TemplatePart::Literal(l) => out.push_str(l),
            TemplatePart::Placeholder { property, converters } => {
                let value = resolved.get(property).cloned().unwrap_or(Value::Null);
                let converted = apply_converters(value, converters)?;
                out.push_str(&value_to_query_string(&converted));
            }
        }
    }
    Ok(out)
}

fn apply_converters(mut value: Value, converters: &[Converter]) -> Result<Value> {
    for converter in converters {
        value = converter.apply(value)?;
    }
    Ok(value)
}

/// Renders a `{{...}}`-delimited nested-JSON fragment embedded in a
/// query-format template and deep-merges it into an outgoing JSON
/// payload (POST-JSON search plugin support).
pub fn deep_update(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                deep_update(base_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

/// Combines free-text search fragments with logical operators and a
/// wrapper template, producing a single composite query string.
pub fn combine_free_text(fragments: &[String], operator: &str, wrapper: Option<&str>) -> String {
    let joined = fragments.join(&format!(" {operator} "));
    match wrapper {
        Some(w) => w.replace("{}", &joined),
        None => joined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_const_extract_and_queryable() {
        assert_eq!(Mapping::parse_single("S2_MSI_L1C").unwrap(), Mapping::Const("S2_MSI_L1C".to_string()));
        assert!(matches!(Mapping::parse_single("$.id").unwrap(), Mapping::Extract { .. }));
        let raw = RawMapping::Pair(["{productType}".to_string(), "$.id".to_string()]);
        assert!(matches!(Mapping::parse_raw(raw).unwrap(), Mapping::Queryable { .. }));
    }

    #[test]
    fn jsonpath_zero_one_many_matches() {
        let doc = serde_json::json!({"a": {"b": 1}, "list": [1,2,3]});
        assert_eq!(eval_jsonpath("$.missing", &doc), Extracted::NotAvailable);
        assert_eq!(eval_jsonpath("$.a.b", &doc), Extracted::One(Value::from(1)));
        assert_eq!(
            eval_jsonpath("$.list[*]", &doc),
            Extracted::Many(vec![Value::from(1), Value::from(2), Value::from(3)])
        );
    }

    #[test]
    fn extraction_is_idempotent() {
        let mut mapping = BTreeMap::new();
        mapping.insert("id".to_string(), Mapping::parse_single("$.id").unwrap());
        let engine = MappingEngine::new(mapping);
        let doc = serde_json::json!({"id": "abc"});
        let first = engine.extract_all_json(&doc).unwrap();
        let second = engine.extract_all_json(&doc).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn template_second_pass_resolves_after_primary_extraction() {
        let mut mapping = BTreeMap::new();
        mapping.insert("year".to_string(), Mapping::parse_single("$.year").unwrap());
        mapping.insert("id".to_string(), Mapping::parse_single("product-{year}").unwrap());
        let engine = MappingEngine::new(mapping);
        let doc = serde_json::json!({"year": 2024});
        let result = engine.extract_all_json(&doc).unwrap();
        assert_eq!(result.get("id").unwrap(), "product-2024");
    }

    #[test]
    fn deep_update_merges_nested_objects() {
        let mut base = serde_json::json!({"a": {"b": 1}, "c": 2});
        let overlay = serde_json::json!({"a": {"d": 3}});
        deep_update(&mut base, &overlay);
        assert_eq!(base, serde_json::json!({"a": {"b": 1, "d": 3}, "c": 2}));
    }

    #[test]
    fn combine_free_text_applies_operator_and_wrapper() {
        let combined = combine_free_text(
            &["a".to_string(), "b".to_string()],
            "AND",
            Some("({})"),
        );
        assert_eq!(combined, "(a AND b)");
    }

    #[test]
    fn xpath_rebinds_empty_namespace() {
        let xml = r#"<root xmlns="urn:x"><child>value</child></root>"#;
        let extracted = eval_xpath("root/child", xml).unwrap();
        assert_eq!(extracted, Extracted::One(Value::String("value".to_string())));
    }
}
