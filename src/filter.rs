//! Search filters (RFC 4511 section 4.5.1).
//!
//! `Filter` is a closed tree of variants. Construction helpers that can fail
//! check component arity. AND/OR children keep their order for encoding, but
//! compare as sets.

use crate::ber::{BerElement, TAG_OCTET_STRING, TAG_SEQUENCE};
use crate::error::{LdapError, Result};
use std::fmt;

const FILTER_AND: u8 = 0xA0;
const FILTER_OR: u8 = 0xA1;
const FILTER_NOT: u8 = 0xA2;
const FILTER_EQUALITY: u8 = 0xA3;
const FILTER_SUBSTRINGS: u8 = 0xA4;
const FILTER_GREATER_OR_EQUAL: u8 = 0xA5;
const FILTER_LESS_OR_EQUAL: u8 = 0xA6;
const FILTER_PRESENT: u8 = 0x87;
const FILTER_APPROX: u8 = 0xA8;
const FILTER_EXTENSIBLE: u8 = 0xA9;

const SUBSTRING_INITIAL: u8 = 0x80;
const SUBSTRING_ANY: u8 = 0x81;
const SUBSTRING_FINAL: u8 = 0x82;

const EXT_MATCHING_RULE: u8 = 0x81;
const EXT_TYPE: u8 = 0x82;
const EXT_MATCH_VALUE: u8 = 0x83;
const EXT_DN_ATTRIBUTES: u8 = 0x84;

#[derive(Debug, Clone)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality {
        attr: String,
        value: Vec<u8>,
    },
    Substrings {
        attr: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        final_value: Option<Vec<u8>>,
    },
    GreaterOrEqual {
        attr: String,
        value: Vec<u8>,
    },
    LessOrEqual {
        attr: String,
        value: Vec<u8>,
    },
    Present(String),
    Approx {
        attr: String,
        value: Vec<u8>,
    },
    Extensible {
        attr: Option<String>,
        matching_rule: Option<String>,
        value: Vec<u8>,
        dn_attributes: bool,
    },
}

fn filter_error(msg: impl Into<String>) -> LdapError {
    LdapError::Protocol(msg.into())
}

impl Filter {
    /// Empty AND is the absolute true filter.
    pub fn and(children: Vec<Filter>) -> Self {
        Filter::And(children)
    }

    /// Empty OR is the absolute false filter.
    pub fn or(children: Vec<Filter>) -> Self {
        Filter::Or(children)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(child: Filter) -> Self {
        Filter::Not(Box::new(child))
    }

    pub fn present(attr: impl Into<String>) -> Self {
        Filter::Present(attr.into())
    }

    pub fn equality(attr: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Filter::Equality {
            attr: attr.into(),
            value: value.into(),
        }
    }

    pub fn greater_or_equal(attr: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Filter::GreaterOrEqual {
            attr: attr.into(),
            value: value.into(),
        }
    }

    pub fn less_or_equal(attr: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Filter::LessOrEqual {
            attr: attr.into(),
            value: value.into(),
        }
    }

    pub fn approx(attr: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Filter::Approx {
            attr: attr.into(),
            value: value.into(),
        }
    }

    /// At least one of initial, any or final must be present.
    pub fn substrings(
        attr: impl Into<String>,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        final_value: Option<Vec<u8>>,
    ) -> Result<Self> {
        if initial.is_none() && any.is_empty() && final_value.is_none() {
            return Err(LdapError::Parameter(
                "substring filter needs at least one component".to_string(),
            ));
        }
        Ok(Filter::Substrings {
            attr: attr.into(),
            initial,
            any,
            final_value,
        })
    }

    /// Needs an attribute type, a matching rule, or both.
    pub fn extensible(
        attr: Option<String>,
        matching_rule: Option<String>,
        value: impl Into<Vec<u8>>,
        dn_attributes: bool,
    ) -> Result<Self> {
        if attr.is_none() && matching_rule.is_none() {
            return Err(LdapError::Parameter(
                "extensible match filter needs an attribute type or a matching rule".to_string(),
            ));
        }
        Ok(Filter::Extensible {
            attr,
            matching_rule,
            value: value.into(),
            dn_attributes,
        })
    }

    pub fn encode(&self) -> BerElement {
        match self {
            Filter::And(children) => BerElement::constructed(FILTER_AND, children.iter().map(Filter::encode)),
            Filter::Or(children) => BerElement::constructed(FILTER_OR, children.iter().map(Filter::encode)),
            Filter::Not(child) => BerElement::constructed(FILTER_NOT, vec![child.encode()]),
            Filter::Equality { attr, value } => ava(FILTER_EQUALITY, attr, value),
            Filter::GreaterOrEqual { attr, value } => ava(FILTER_GREATER_OR_EQUAL, attr, value),
            Filter::LessOrEqual { attr, value } => ava(FILTER_LESS_OR_EQUAL, attr, value),
            Filter::Approx { attr, value } => ava(FILTER_APPROX, attr, value),
            Filter::Present(attr) => BerElement::new(FILTER_PRESENT, attr.as_bytes()),
            Filter::Substrings {
                attr,
                initial,
                any,
                final_value,
            } => {
                let mut parts = Vec::new();
                if let Some(i) = initial {
                    parts.push(BerElement::octet_string_with_tag(SUBSTRING_INITIAL, i.clone()));
                }
                for a in any {
                    parts.push(BerElement::octet_string_with_tag(SUBSTRING_ANY, a.clone()));
                }
                if let Some(f) = final_value {
                    parts.push(BerElement::octet_string_with_tag(SUBSTRING_FINAL, f.clone()));
                }
                BerElement::constructed(
                    FILTER_SUBSTRINGS,
                    vec![BerElement::octet_string(attr.as_bytes()), BerElement::sequence(parts)],
                )
            }
            Filter::Extensible {
                attr,
                matching_rule,
                value,
                dn_attributes,
            } => {
                let mut parts = Vec::new();
                if let Some(r) = matching_rule {
                    parts.push(BerElement::octet_string_with_tag(EXT_MATCHING_RULE, r.as_bytes()));
                }
                if let Some(a) = attr {
                    parts.push(BerElement::octet_string_with_tag(EXT_TYPE, a.as_bytes()));
                }
                parts.push(BerElement::octet_string_with_tag(EXT_MATCH_VALUE, value.clone()));
                if *dn_attributes {
                    parts.push(BerElement::boolean_with_tag(EXT_DN_ATTRIBUTES, true));
                }
                BerElement::constructed(FILTER_EXTENSIBLE, parts)
            }
        }
    }

    pub fn decode(el: &BerElement) -> Result<Self> {
        match el.tag() {
            FILTER_AND => Ok(Filter::And(decode_children(el)?)),
            FILTER_OR => Ok(Filter::Or(decode_children(el)?)),
            FILTER_NOT => {
                let mut children = decode_children(el)?;
                if children.len() != 1 {
                    return Err(filter_error(format!(
                        "NOT filter must have exactly one element, got {}",
                        children.len()
                    )));
                }
                Ok(Filter::not(children.remove(0)))
            }
            FILTER_EQUALITY => decode_ava(el).map(|(attr, value)| Filter::Equality { attr, value }),
            FILTER_GREATER_OR_EQUAL => decode_ava(el).map(|(attr, value)| Filter::GreaterOrEqual { attr, value }),
            FILTER_LESS_OR_EQUAL => decode_ava(el).map(|(attr, value)| Filter::LessOrEqual { attr, value }),
            FILTER_APPROX => decode_ava(el).map(|(attr, value)| Filter::Approx { attr, value }),
            FILTER_PRESENT => Ok(Filter::Present(el.as_string()?)),
            FILTER_SUBSTRINGS => decode_substrings(el),
            FILTER_EXTENSIBLE => decode_extensible(el),
            other => Err(filter_error(format!("Unsupported filter tag: 0x{:02X}", other))),
        }
    }

    fn attribute_name(&self) -> Option<&str> {
        match self {
            Filter::Equality { attr, .. }
            | Filter::Substrings { attr, .. }
            | Filter::GreaterOrEqual { attr, .. }
            | Filter::LessOrEqual { attr, .. }
            | Filter::Approx { attr, .. }
            | Filter::Present(attr) => Some(attr),
            _ => None,
        }
    }
}

fn ava(tag: u8, attr: &str, value: &[u8]) -> BerElement {
    BerElement::constructed(
        tag,
        vec![
            BerElement::octet_string(attr.as_bytes()),
            BerElement::octet_string(value.to_vec()),
        ],
    )
}

fn decode_children(el: &BerElement) -> Result<Vec<Filter>> {
    el.children()?.iter().map(Filter::decode).collect()
}

fn decode_ava(el: &BerElement) -> Result<(String, Vec<u8>)> {
    let children = el.children()?;
    if children.len() != 2 {
        return Err(filter_error(format!(
            "attribute value assertion must have 2 elements, got {}",
            children.len()
        )));
    }
    if children[0].tag() != TAG_OCTET_STRING || children[1].tag() != TAG_OCTET_STRING {
        return Err(filter_error("attribute value assertion must contain octet strings"));
    }
    Ok((children[0].as_string()?, children[1].value().to_vec()))
}

fn decode_substrings(el: &BerElement) -> Result<Filter> {
    let children = el.children()?;
    if children.len() != 2 || children[1].tag() != TAG_SEQUENCE {
        return Err(filter_error("substring filter must be { type, SEQUENCE OF substring }"));
    }
    let attr = children[0].as_string()?;
    let mut initial = None;
    let mut any = Vec::new();
    let mut final_value = None;
    for (i, part) in children[1].children()?.into_iter().enumerate() {
        match part.tag() {
            SUBSTRING_INITIAL if i == 0 && initial.is_none() => initial = Some(part.into_value()),
            SUBSTRING_ANY if final_value.is_none() => any.push(part.into_value()),
            SUBSTRING_FINAL if final_value.is_none() => final_value = Some(part.into_value()),
            other => {
                return Err(filter_error(format!(
                    "unexpected substring component 0x{:02X} at position {}",
                    other, i
                )))
            }
        }
    }
    Filter::substrings(attr, initial, any, final_value).map_err(|e| filter_error(e.to_string()))
}

fn decode_extensible(el: &BerElement) -> Result<Filter> {
    let mut attr = None;
    let mut matching_rule = None;
    let mut value = None;
    let mut dn_attributes = false;
    for part in el.children()? {
        match part.tag() {
            EXT_MATCHING_RULE => matching_rule = Some(part.as_string()?),
            EXT_TYPE => attr = Some(part.as_string()?),
            EXT_MATCH_VALUE => value = Some(part.into_value()),
            EXT_DN_ATTRIBUTES => dn_attributes = part.as_boolean()?,
            other => return Err(filter_error(format!("unexpected extensible match component 0x{:02X}", other))),
        }
    }
    let value = value.ok_or_else(|| filter_error("extensible match filter has no match value"))?;
    Filter::extensible(attr, matching_rule, value, dn_attributes).map_err(|e| filter_error(e.to_string()))
}

/// Order-insensitive comparison that still counts repeated children.
fn same_children_as_set(a: &[Filter], b: &[Filter]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut matched = vec![false; b.len()];
    a.iter().all(|x| {
        match b.iter().enumerate().position(|(i, y)| !matched[i] && x == y) {
            Some(i) => {
                matched[i] = true;
                true
            }
            None => false,
        }
    })
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Filter::And(a), Filter::And(b)) | (Filter::Or(a), Filter::Or(b)) => same_children_as_set(a, b),
            (Filter::Not(a), Filter::Not(b)) => a == b,
            (Filter::Equality { value: va, .. }, Filter::Equality { value: vb, .. })
            | (Filter::GreaterOrEqual { value: va, .. }, Filter::GreaterOrEqual { value: vb, .. })
            | (Filter::LessOrEqual { value: va, .. }, Filter::LessOrEqual { value: vb, .. })
            | (Filter::Approx { value: va, .. }, Filter::Approx { value: vb, .. }) => {
                va == vb && names_match(self, other)
            }
            (Filter::Present(_), Filter::Present(_)) => names_match(self, other),
            (
                Filter::Substrings {
                    initial: ia,
                    any: aa,
                    final_value: fa,
                    ..
                },
                Filter::Substrings {
                    initial: ib,
                    any: ab,
                    final_value: fb,
                    ..
                },
            ) => ia == ib && aa == ab && fa == fb && names_match(self, other),
            (
                Filter::Extensible {
                    attr: aa,
                    matching_rule: ra,
                    value: va,
                    dn_attributes: da,
                },
                Filter::Extensible {
                    attr: ab,
                    matching_rule: rb,
                    value: vb,
                    dn_attributes: db,
                },
            ) => {
                let eq_ci = |x: &Option<String>, y: &Option<String>| match (x, y) {
                    (Some(x), Some(y)) => x.eq_ignore_ascii_case(y),
                    (None, None) => true,
                    _ => false,
                };
                eq_ci(aa, ab) && eq_ci(ra, rb) && va == vb && da == db
            }
            _ => false,
        }
    }
}

impl Eq for Filter {}

fn names_match(a: &Filter, b: &Filter) -> bool {
    match (a.attribute_name(), b.attribute_name()) {
        (Some(x), Some(y)) => x.eq_ignore_ascii_case(y),
        _ => false,
    }
}

/// RFC 4515 value escaping.
fn escape_value(value: &[u8], out: &mut String) {
    for &b in value {
        match b {
            b'*' | b'(' | b')' | b'\\' | 0x00 => out.push_str(&format!("\\{:02x}", b)),
            0x20..=0x7E => out.push(b as char),
            _ => out.push_str(&format!("\\{:02x}", b)),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        match self {
            Filter::And(children) | Filter::Or(children) => {
                s.push('(');
                s.push(if matches!(self, Filter::And(_)) { '&' } else { '|' });
                for c in children {
                    s.push_str(&c.to_string());
                }
                s.push(')');
            }
            Filter::Not(child) => s.push_str(&format!("(!{})", child)),
            Filter::Equality { attr, value } => {
                s.push_str(&format!("({}=", attr));
                escape_value(value, &mut s);
                s.push(')');
            }
            Filter::GreaterOrEqual { attr, value } => {
                s.push_str(&format!("({}>=", attr));
                escape_value(value, &mut s);
                s.push(')');
            }
            Filter::LessOrEqual { attr, value } => {
                s.push_str(&format!("({}<=", attr));
                escape_value(value, &mut s);
                s.push(')');
            }
            Filter::Approx { attr, value } => {
                s.push_str(&format!("({}~=", attr));
                escape_value(value, &mut s);
                s.push(')');
            }
            Filter::Present(attr) => s.push_str(&format!("({}=*)", attr)),
            Filter::Substrings {
                attr,
                initial,
                any,
                final_value,
            } => {
                s.push_str(&format!("({}=", attr));
                if let Some(i) = initial {
                    escape_value(i, &mut s);
                }
                s.push('*');
                for a in any {
                    escape_value(a, &mut s);
                    s.push('*');
                }
                if let Some(v) = final_value {
                    escape_value(v, &mut s);
                }
                s.push(')');
            }
            Filter::Extensible {
                attr,
                matching_rule,
                value,
                dn_attributes,
            } => {
                s.push('(');
                if let Some(a) = attr {
                    s.push_str(a);
                }
                if *dn_attributes {
                    s.push_str(":dn");
                }
                if let Some(r) = matching_rule {
                    s.push(':');
                    s.push_str(r);
                }
                s.push_str(":=");
                escape_value(value, &mut s);
                s.push(')');
            }
        }
        f.write_str(&s)
    }
}
