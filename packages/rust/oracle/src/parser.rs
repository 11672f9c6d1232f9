//! Strict parser for structured oracle replies.
//!
//! Oracle answers carry data in `*key: value` lines, one field per line.
//! Prose lines without the leading `*` are ignored, but a malformed field
//! line (a `*` line with no colon, a non-numeric mass, an unknown unit) is
//! a hard [`CarbonBomError::Parse`] — never a silent null.

use std::collections::BTreeMap;

use carbonbom_shared::{BomItem, CarbonBomError, MassUnit, Result, Verdict};

/// Marker the oracle appends when it has more BOM lines to emit.
const CONTINUATION_MARKER: &str = "GO_AGAIN";

/// Marker the oracle appends when its listing is complete.
const DONE_MARKER: &str = "DONE";

/// Sentinel value meaning "no answer" for an optional field.
fn is_na(value: &str) -> bool {
    let v = value.trim();
    v.eq_ignore_ascii_case("n/a") || v.eq_ignore_ascii_case("none")
}

fn is_unknown(value: &str) -> bool {
    is_na(value) || value.trim().eq_ignore_ascii_case("unknown")
}

// ---------------------------------------------------------------------------
// Field extraction
// ---------------------------------------------------------------------------

/// Extract `(key, value)` pairs from every `*key: value` line, in order.
pub fn parse_fields(text: &str) -> Result<Vec<(String, String)>> {
    let mut fields = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('*') else {
            continue;
        };
        let Some((key, value)) = rest.split_once(':') else {
            return Err(CarbonBomError::parse(format!(
                "malformed field line (no colon): {line}"
            )));
        };
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(CarbonBomError::parse(format!(
                "malformed field line (empty key): {line}"
            )));
        }
        fields.push((key, value.trim().to_string()));
    }
    Ok(fields)
}

/// Field pairs as a map. Repeated keys keep the last occurrence, so a
/// correction later in the same reply overrides the original line.
pub fn fields_map(text: &str) -> Result<BTreeMap<String, String>> {
    Ok(parse_fields(text)?.into_iter().collect())
}

fn required<'a>(map: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str> {
    map.get(key)
        .map(String::as_str)
        .ok_or_else(|| CarbonBomError::parse(format!("missing required field *{key}")))
}

fn parse_f64(key: &str, value: &str) -> Result<f64> {
    let cleaned = value.replace(',', "");
    cleaned
        .trim()
        .parse::<f64>()
        .map_err(|_| CarbonBomError::parse(format!("field *{key} is not a number: {value}")))
}

fn parse_unit(key: &str, value: &str) -> Result<MassUnit> {
    MassUnit::parse(value)
        .ok_or_else(|| CarbonBomError::parse(format!("field *{key} has unknown unit: {value}")))
}

// ---------------------------------------------------------------------------
// Chat-loop markers
// ---------------------------------------------------------------------------

/// True when the reply's last non-empty line asks for another turn.
pub fn has_continuation_marker(text: &str) -> bool {
    last_line(text).eq_ignore_ascii_case(CONTINUATION_MARKER)
}

/// True when the reply's last non-empty line declares the listing finished.
pub fn has_done_marker(text: &str) -> bool {
    last_line(text).eq_ignore_ascii_case(DONE_MARKER)
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
}

// ---------------------------------------------------------------------------
// BOM parsing
// ---------------------------------------------------------------------------

/// Parse indexed BOM lines (`*item_3_name: ...`, `*item_3_supplier: ...`).
///
/// Indices are taken verbatim from the oracle and never renumbered; items
/// are returned in ascending index order. A name of `N/A` is preserved so
/// the verification pass can use it as a deletion marker.
pub fn parse_bom(text: &str) -> Result<Vec<BomItem>> {
    let mut items: BTreeMap<u32, BomItem> = BTreeMap::new();

    for (key, value) in parse_fields(text)? {
        let Some(rest) = key.strip_prefix("item_") else {
            continue;
        };
        let Some((index_str, attr)) = rest.split_once('_') else {
            return Err(CarbonBomError::parse(format!(
                "malformed item field: *{key}"
            )));
        };
        let index: u32 = index_str.parse().map_err(|_| {
            CarbonBomError::parse(format!("item field has non-numeric index: *{key}"))
        })?;

        let item = items.entry(index).or_insert_with(|| BomItem {
            index,
            name: String::new(),
            supplier: None,
            description: None,
            mass: None,
            unit: None,
        });

        match attr {
            "name" => item.name = value,
            "supplier" => item.supplier = (!is_na(&value)).then_some(value),
            "description" => item.description = (!is_na(&value)).then_some(value),
            "mass" => {
                item.mass = if is_na(&value) {
                    None
                } else {
                    Some(parse_f64(&key, &value)?)
                }
            }
            "unit" => {
                item.unit = if is_na(&value) {
                    None
                } else {
                    Some(parse_unit(&key, &value)?)
                }
            }
            other => {
                return Err(CarbonBomError::parse(format!(
                    "unknown item attribute `{other}` in *{key}"
                )));
            }
        }
    }

    for item in items.values() {
        if item.name.is_empty() {
            return Err(CarbonBomError::parse(format!(
                "item {} has fields but no *item_{}_name",
                item.index, item.index
            )));
        }
    }

    Ok(items.into_values().collect())
}

// ---------------------------------------------------------------------------
// Enrichment replies
// ---------------------------------------------------------------------------

/// Parse an exact-mass reply. `Ok(None)` means the oracle could not find an
/// exact figure and the estimation fallback should run.
pub fn parse_mass_exact(text: &str) -> Result<Option<(f64, MassUnit)>> {
    let map = fields_map(text)?;
    let value = required(&map, "mass_value")?;
    if is_unknown(value) {
        return Ok(None);
    }
    let mass = parse_f64("mass_value", value)?;
    let unit = parse_unit("mass_unit", required(&map, "mass_unit")?)?;
    Ok(Some((mass, unit)))
}

/// Parse an estimated-mass reply. The estimate must commit to a number and
/// justify it; refusing is a parse failure here.
pub fn parse_mass_estimate(text: &str) -> Result<(f64, MassUnit, String)> {
    let map = fields_map(text)?;
    let mass = parse_f64("mass_value", required(&map, "mass_value")?)?;
    let unit = parse_unit("mass_unit", required(&map, "mass_unit")?)?;
    let reasoning = required(&map, "reasoning")?.to_string();
    if reasoning.is_empty() || is_na(&reasoning) {
        return Err(CarbonBomError::parse(
            "mass estimate is missing its *reasoning",
        ));
    }
    Ok((mass, unit, reasoning))
}

/// Parse a supplier reply. `Ok(None)` means the supplier is unknown, which
/// marks the node terminal downstream.
pub fn parse_supplier(text: &str) -> Result<Option<String>> {
    let map = fields_map(text)?;
    let value = required(&map, "supplier")?;
    Ok((!is_unknown(value)).then(|| value.to_string()))
}

/// Parsed address/origin reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressReply {
    pub address: Option<String>,
    pub country: Option<String>,
    /// True when the country was inferred rather than sourced.
    pub estimated: bool,
}

/// Parse an address reply. At least one of address or country must be
/// present.
pub fn parse_address(text: &str) -> Result<AddressReply> {
    let map = fields_map(text)?;
    let address = map
        .get("supplier_address")
        .filter(|v| !is_unknown(v))
        .cloned();
    let country = map
        .get("country_of_origin")
        .filter(|v| !is_unknown(v))
        .cloned();
    let estimated = map
        .get("origin_estimated")
        .map(|v| v.eq_ignore_ascii_case("yes") || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if address.is_none() && country.is_none() {
        return Err(CarbonBomError::parse(
            "address reply has neither *supplier_address nor *country_of_origin",
        ));
    }
    Ok(AddressReply {
        address,
        country,
        estimated,
    })
}

/// Parse a terminal-classification verdict.
pub fn parse_verdict(text: &str) -> Result<Verdict> {
    let map = fields_map(text)?;
    let value = required(&map, "verdict")?;
    match value.to_ascii_lowercase().as_str() {
        "continue" => Ok(Verdict::Continue),
        "done" => Ok(Verdict::Terminal),
        "software_or_service" => Ok(Verdict::Intangible),
        other => Err(CarbonBomError::parse(format!("unknown verdict: {other}"))),
    }
}

/// Parse an emissions estimate in kgCO2e.
pub fn parse_emissions(text: &str) -> Result<f64> {
    let map = fields_map(text)?;
    let value = parse_f64("cf_value", required(&map, "cf_value")?)?;
    if !value.is_finite() || value < 0.0 {
        return Err(CarbonBomError::parse(format!(
            "field *cf_value out of range: {value}"
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_ignore_prose_lines() {
        let text = "Here is what I found:\n*supplier: Acme\nHope that helps!";
        let fields = parse_fields(text).expect("parse");
        assert_eq!(fields, vec![("supplier".into(), "Acme".into())]);
    }

    #[test]
    fn malformed_field_line_is_an_error() {
        let text = "*supplier Acme Corp";
        let err = parse_fields(text).expect_err("should fail");
        assert!(err.to_string().contains("no colon"));
    }

    #[test]
    fn repeated_key_keeps_last_value() {
        let text = "*supplier: Acme\n*supplier: BoltCo";
        let map = fields_map(text).expect("parse");
        assert_eq!(map.get("supplier").map(String::as_str), Some("BoltCo"));
    }

    #[test]
    fn bom_items_collated_by_index() {
        let text = "\
*item_2_name: Screen
*item_2_supplier: GlassCo
*item_1_name: Battery
*item_1_mass: 55
*item_1_unit: g
*item_1_supplier: N/A";
        let items = parse_bom(text).expect("parse bom");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].index, 1);
        assert_eq!(items[0].name, "Battery");
        assert_eq!(items[0].mass, Some(55.0));
        assert_eq!(items[0].unit, Some(MassUnit::G));
        assert_eq!(items[0].supplier, None);
        assert_eq!(items[1].index, 2);
        assert_eq!(items[1].supplier.as_deref(), Some("GlassCo"));
    }

    #[test]
    fn bom_deletion_marker_is_preserved() {
        let items = parse_bom("*item_3_name: N/A").expect("parse");
        assert_eq!(items[0].name, "N/A");
    }

    #[test]
    fn bom_item_without_name_is_an_error() {
        let err = parse_bom("*item_1_supplier: Acme").expect_err("should fail");
        assert!(err.to_string().contains("no *item_1_name"));
    }

    #[test]
    fn bom_bad_mass_is_an_error() {
        let err = parse_bom("*item_1_name: Screw\n*item_1_mass: heavy").expect_err("should fail");
        assert!(err.to_string().contains("not a number"));
    }

    #[test]
    fn bom_unknown_attribute_is_an_error() {
        let err = parse_bom("*item_1_color: red").expect_err("should fail");
        assert!(err.to_string().contains("unknown item attribute"));
    }

    #[test]
    fn mass_exact_found() {
        let result = parse_mass_exact("*mass_value: 1,200\n*mass_unit: g").expect("parse");
        assert_eq!(result, Some((1200.0, MassUnit::G)));
    }

    #[test]
    fn mass_exact_unknown_triggers_fallback() {
        let result = parse_mass_exact("*mass_value: Unknown").expect("parse");
        assert_eq!(result, None);
    }

    #[test]
    fn mass_estimate_requires_reasoning() {
        let err = parse_mass_estimate("*mass_value: 50\n*mass_unit: g\n*reasoning: N/A")
            .expect_err("should fail");
        assert!(err.to_string().contains("reasoning"));

        let (mass, unit, reasoning) = parse_mass_estimate(
            "*mass_value: 50\n*mass_unit: g\n*reasoning: typical AA cell mass",
        )
        .expect("parse");
        assert_eq!(mass, 50.0);
        assert_eq!(unit, MassUnit::G);
        assert_eq!(reasoning, "typical AA cell mass");
    }

    #[test]
    fn supplier_unknown_maps_to_none() {
        assert_eq!(parse_supplier("*supplier: Unknown").expect("parse"), None);
        assert_eq!(
            parse_supplier("*supplier: Acme").expect("parse"),
            Some("Acme".into())
        );
        assert!(parse_supplier("no fields here").is_err());
    }

    #[test]
    fn address_reply_variants() {
        let reply = parse_address(
            "*supplier_address: 1 Factory Rd, Osaka\n*country_of_origin: Japan",
        )
        .expect("parse");
        assert_eq!(reply.address.as_deref(), Some("1 Factory Rd, Osaka"));
        assert_eq!(reply.country.as_deref(), Some("Japan"));
        assert!(!reply.estimated);

        let reply =
            parse_address("*country_of_origin: China\n*origin_estimated: yes").expect("parse");
        assert!(reply.address.is_none());
        assert!(reply.estimated);

        assert!(parse_address("*supplier_address: Unknown").is_err());
    }

    #[test]
    fn verdict_tokens() {
        assert_eq!(parse_verdict("*verdict: Continue").unwrap(), Verdict::Continue);
        assert_eq!(parse_verdict("*verdict: done").unwrap(), Verdict::Terminal);
        assert_eq!(
            parse_verdict("*verdict: software_or_service").unwrap(),
            Verdict::Intangible
        );
        assert!(parse_verdict("*verdict: maybe").is_err());
    }

    #[test]
    fn emissions_value_range() {
        assert_eq!(parse_emissions("*cf_value: 2.5").unwrap(), 2.5);
        assert!(parse_emissions("*cf_value: -1").is_err());
        assert!(parse_emissions("*cf_value: lots").is_err());
    }

    #[test]
    fn chat_loop_markers() {
        assert!(has_continuation_marker("*item_1_name: X\nGO_AGAIN"));
        assert!(has_continuation_marker("*item_1_name: X\ngo_again\n\n"));
        assert!(!has_continuation_marker("*item_1_name: X\nDONE"));
        assert!(has_done_marker("*item_1_name: X\nDone"));
        assert!(!has_done_marker(""));
    }
}
