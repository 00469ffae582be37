// LDAP v3 message model for the client side: requests, controls, attributes,
// entries and modifications, plus decoding of server responses.
// Values are always stored as raw bytes; strings are accepted as input and
// converted on construction.

use crate::ber::{self, BerElement, BerWriter, TAG_OCTET_STRING, TAG_SEQUENCE, TAG_SET};
use crate::error::{LdapError, Result, ResultCode};
use crate::filter::Filter;
use crate::matching::{CaseIgnoreStringMatch, MatchingRule};
use base64::Engine;
use std::fmt;
use std::hash::{Hash, Hasher};

// LDAP protocol tag constants
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;
pub const LDAP_TAG_INTERMEDIATE_RESPONSE: u8 = 0x79;

/// Context [0] IMPLICIT SEQUENCE OF control
const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;
const AUTH_SIMPLE: u8 = 0x80;
const AUTH_SASL: u8 = 0xA3;
const REFERRAL: u8 = 0xA3;
const SERVER_SASL_CREDS: u8 = 0x87;
const EXTENDED_REQUEST_NAME: u8 = 0x80;
const EXTENDED_REQUEST_VALUE: u8 = 0x81;
const EXTENDED_RESPONSE_NAME: u8 = 0x8A;
const EXTENDED_RESPONSE_VALUE: u8 = 0x8B;

pub const LDAP_VERSION: i64 = 3;

/// RFC 4532 "Who am I?" extended operation.
pub const WHO_AM_I_OID: &str = "1.3.6.1.4.1.4203.1.11.3";
/// RFC 4511 notice of disconnection (unsolicited, message ID 0).
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// Attributes whose values are replaced by a placeholder in rendered output.
const SENSITIVE_ATTRIBUTES: &[&str] = &[
    "userpassword",
    "2.5.4.35",
    "authpassword",
    "1.3.6.1.4.1.4203.1.3.4",
    "unicodepwd",
    "1.2.840.113556.1.4.90",
];

pub const REDACTED_VALUE: &str = "---redacted-value---";

pub fn is_sensitive_attribute(name: &str) -> bool {
    let base = name.split(';').next().unwrap_or(name);
    SENSITIVE_ATTRIBUTES
        .iter()
        .any(|s| s.eq_ignore_ascii_case(base))
}

fn protocol_error(msg: impl Into<String>) -> LdapError {
    LdapError::Protocol(msg.into())
}

fn expect_children(el: &BerElement, min: usize, max: usize, what: &str) -> Result<Vec<BerElement>> {
    let children = el.children()?;
    if children.len() < min || children.len() > max {
        return Err(protocol_error(format!(
            "{} must contain {}..={} elements, got {}",
            what,
            min,
            max,
            children.len()
        )));
    }
    Ok(children)
}

fn expect_tag(el: &BerElement, tag: u8, what: &str) -> Result<()> {
    if el.tag() != tag {
        return Err(protocol_error(format!(
            "{}: expected tag 0x{:02X}, got 0x{:02X}",
            what,
            tag,
            el.tag()
        )));
    }
    Ok(())
}

fn decode_string(el: &BerElement, what: &str) -> Result<String> {
    expect_tag(el, TAG_OCTET_STRING, what)?;
    Ok(el.as_string()?)
}

// LDAP Control (request or response)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Control {
    pub oid: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

impl Control {
    pub fn new(oid: impl Into<String>, critical: bool, value: Option<Vec<u8>>) -> Self {
        Self {
            oid: oid.into(),
            critical,
            value,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.oid.trim().is_empty() {
            return Err(LdapError::Parameter("control OID must not be empty".to_string()));
        }
        Ok(())
    }

    /// Control ::= SEQUENCE { controlType, criticality BOOLEAN DEFAULT FALSE, controlValue OPTIONAL }
    pub fn encode(&self) -> BerElement {
        let mut children = vec![BerElement::octet_string(self.oid.as_bytes())];
        if self.critical {
            children.push(BerElement::boolean(true));
        }
        if let Some(ref v) = self.value {
            children.push(BerElement::octet_string(v.clone()));
        }
        BerElement::sequence(children)
    }

    pub fn decode(el: &BerElement) -> Result<Self> {
        expect_tag(el, TAG_SEQUENCE, "control")?;
        let children = expect_children(el, 1, 3, "control")?;
        let oid = decode_string(&children[0], "control OID")?;
        let mut critical = false;
        let mut value = None;
        for child in &children[1..] {
            match child.tag() {
                ber::TAG_BOOLEAN if value.is_none() => critical = child.as_boolean()?,
                TAG_OCTET_STRING if value.is_none() => value = Some(child.value().to_vec()),
                other => {
                    return Err(protocol_error(format!(
                        "unexpected element 0x{:02X} in control {}",
                        other, oid
                    )))
                }
            }
        }
        Ok(Self { oid, critical, value })
    }
}

fn encode_controls(controls: &[Control]) -> Option<BerElement> {
    if controls.is_empty() {
        return None;
    }
    Some(BerElement::constructed(
        LDAP_CONTEXT_CONTROLS,
        controls.iter().map(Control::encode),
    ))
}

fn decode_controls(el: &BerElement) -> Result<Vec<Control>> {
    el.children()?.iter().map(Control::decode).collect()
}

/// Attribute with set semantics over its values: exact duplicates are collapsed,
/// and equality ignores value order and name case.
#[derive(Debug, Clone)]
pub struct Attribute {
    name: String,
    values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new<N, I, V>(name: N, values: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = V>,
        V: Into<Vec<u8>>,
    {
        let mut attr = Self::empty(name);
        for v in values {
            attr.add_value(v);
        }
        attr
    }

    /// Keeps repeated values, as modification value lists do.
    pub fn with_duplicates<N, I, V>(name: N, values: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = V>,
        V: Into<Vec<u8>>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name without attribute options (`userPassword;binary` -> `userPassword`).
    pub fn base_name(&self) -> &str {
        self.name.split(';').next().unwrap_or(&self.name)
    }

    pub fn name_matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn values(&self) -> &[Vec<u8>] {
        &self.values
    }

    pub fn value_strings(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    pub fn first_value_string(&self) -> Option<String> {
        self.values.first().map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns false when the value was already present.
    pub fn add_value(&mut self, value: impl Into<Vec<u8>>) -> bool {
        let value = value.into();
        if self.has_value(&value) {
            return false;
        }
        self.values.push(value);
        true
    }

    pub fn remove_value(&mut self, value: &[u8]) -> bool {
        let before = self.values.len();
        self.values.retain(|v| v.as_slice() != value);
        before != self.values.len()
    }

    pub fn has_value(&self, value: &[u8]) -> bool {
        self.values.iter().any(|v| v.as_slice() == value)
    }

    pub fn has_value_ignore_case(&self, value: &str) -> bool {
        self.has_value_with(value.as_bytes(), &CaseIgnoreStringMatch)
    }

    pub fn has_value_with(&self, value: &[u8], rule: &dyn MatchingRule) -> bool {
        self.values.iter().any(|v| rule.values_match(v, value))
    }

    /// PartialAttribute ::= SEQUENCE { type, vals SET OF value }
    pub fn encode(&self) -> BerElement {
        BerElement::sequence(vec![
            BerElement::octet_string(self.name.as_bytes()),
            BerElement::set(self.values.iter().map(|v| BerElement::octet_string(v.clone()))),
        ])
    }

    pub fn decode(el: &BerElement) -> Result<Self> {
        Self::decode_values(el, true)
    }

    fn decode_values(el: &BerElement, dedup: bool) -> Result<Self> {
        expect_tag(el, TAG_SEQUENCE, "attribute")?;
        let children = expect_children(el, 2, 2, "attribute")?;
        let name = decode_string(&children[0], "attribute type")?;
        expect_tag(&children[1], TAG_SET, "attribute values")?;
        let mut attr = Attribute::empty(name);
        for v in children[1].children()? {
            expect_tag(&v, TAG_OCTET_STRING, "attribute value")?;
            if dedup {
                attr.add_value(v.into_value());
            } else {
                attr.values.push(v.into_value());
            }
        }
        Ok(attr)
    }

    fn sorted_values(&self) -> Vec<&Vec<u8>> {
        let mut sorted: Vec<&Vec<u8>> = self.values.iter().collect();
        sorted.sort();
        sorted
    }
}

// Values compare as a multiset; attributes built through add_value never hold repeats.
impl PartialEq for Attribute {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self.values.len() == other.values.len()
            && self.sorted_values() == other.sorted_values()
    }
}

impl Eq for Attribute {}

impl Hash for Attribute {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.to_ascii_lowercase().hash(state);
        self.sorted_values().hash(state);
    }
}

/// Directory entry. Attribute names are unique (case-insensitively); adding an
/// attribute that already exists merges its values.
#[derive(Debug, Clone)]
pub struct Entry {
    dn: String,
    attributes: Vec<Attribute>,
}

impl Entry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attributes<I: IntoIterator<Item = Attribute>>(dn: impl Into<String>, attributes: I) -> Self {
        let mut entry = Self::new(dn);
        for a in attributes {
            entry.add_attribute(a);
        }
        entry
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    pub fn set_dn(&mut self, dn: impl Into<String>) {
        self.dn = dn.into();
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn into_attributes(self) -> Vec<Attribute> {
        self.attributes
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        match self.attributes.iter_mut().find(|a| a.name_matches(attribute.name())) {
            Some(existing) => {
                for v in attribute.values {
                    existing.add_value(v);
                }
            }
            None => self.attributes.push(attribute),
        }
    }

    pub fn add_value(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        self.add_attribute(Attribute::new(name, [value.into()]));
    }

    pub fn get_attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name_matches(name))
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Attribute> {
        let idx = self.attributes.iter().position(|a| a.name_matches(name))?;
        Some(self.attributes.remove(idx))
    }

    pub fn has_attribute_named(&self, name: &str) -> bool {
        self.get_attribute(name).is_some()
    }

    /// True only when an attribute with the same name has exactly the same value set.
    pub fn has_attribute(&self, attribute: &Attribute) -> bool {
        self.get_attribute(attribute.name()) == Some(attribute)
    }

    pub fn has_attribute_value(&self, name: &str, value: &[u8]) -> bool {
        self.get_attribute(name).map(|a| a.has_value(value)).unwrap_or(false)
    }

    pub fn has_attribute_value_ignore_case(&self, name: &str, value: &str) -> bool {
        self.get_attribute(name)
            .map(|a| a.has_value_ignore_case(value))
            .unwrap_or(false)
    }

    pub fn has_attribute_value_with(&self, name: &str, value: &[u8], rule: &dyn MatchingRule) -> bool {
        self.get_attribute(name)
            .map(|a| a.has_value_with(value, rule))
            .unwrap_or(false)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.dn.eq_ignore_ascii_case(&other.dn)
            && self.attributes.len() == other.attributes.len()
            && self.attributes.iter().all(|a| other.has_attribute(a))
    }
}

impl Eq for Entry {}

/// External producer of entries (e.g. an LDIF reader).
pub trait EntrySource {
    fn next_entry(&mut self) -> Result<Option<Entry>>;
}

impl<I: Iterator<Item = Entry>> EntrySource for I {
    fn next_entry(&mut self) -> Result<Option<Entry>> {
        Ok(self.next())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModificationType {
    Add,
    Delete,
    Replace,
    Increment,
    /// Code outside the four known types; preserved as-is.
    Unknown(i32),
}

impl ModificationType {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ModificationType::Add,
            1 => ModificationType::Delete,
            2 => ModificationType::Replace,
            3 => ModificationType::Increment,
            other => ModificationType::Unknown(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ModificationType::Add => 0,
            ModificationType::Delete => 1,
            ModificationType::Replace => 2,
            ModificationType::Increment => 3,
            ModificationType::Unknown(c) => c,
        }
    }

    fn ldif_keyword(self) -> String {
        match self {
            ModificationType::Add => "add".to_string(),
            ModificationType::Delete => "delete".to_string(),
            ModificationType::Replace => "replace".to_string(),
            ModificationType::Increment => "increment".to_string(),
            ModificationType::Unknown(c) => format!("unknown-{}", c),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Modification {
    pub mod_type: ModificationType,
    pub attribute: Attribute,
}

impl Modification {
    pub fn new(mod_type: ModificationType, attribute: Attribute) -> Self {
        Self { mod_type, attribute }
    }

    pub fn with_values<I, V>(mod_type: ModificationType, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Vec<u8>>,
    {
        Self::new(mod_type, Attribute::with_duplicates(name, values))
    }

    pub fn encode(&self) -> BerElement {
        BerElement::sequence(vec![
            BerElement::enumerated(self.mod_type.code() as i64),
            self.attribute.encode(),
        ])
    }

    pub fn decode(el: &BerElement) -> Result<Self> {
        expect_tag(el, TAG_SEQUENCE, "modification")?;
        let children = expect_children(el, 2, 2, "modification")?;
        expect_tag(&children[0], ber::TAG_ENUMERATED, "modification type")?;
        let code = children[0].as_i32()?;
        Ok(Self {
            mod_type: ModificationType::from_code(code),
            attribute: Attribute::decode_values(&children[1], false)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<i64> for SearchScope {
    type Error = LdapError;
    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => Err(protocol_error(format!("Invalid search scope: {}", value))),
        }
    }
}

fn validate_dn(dn: &str, what: &str) -> Result<()> {
    if dn.trim().is_empty() {
        return Err(LdapError::Parameter(format!("{} requires a non-empty DN", what)));
    }
    Ok(())
}

fn validate_controls(controls: &[Control]) -> Result<()> {
    controls.iter().try_for_each(Control::validate)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub dn: String,
    pub attributes: Vec<Attribute>,
    pub controls: Vec<Control>,
}

impl AddRequest {
    pub fn new<I: IntoIterator<Item = Attribute>>(dn: impl Into<String>, attributes: I) -> Self {
        let entry = Entry::with_attributes(dn, attributes);
        Self::from_entry(entry)
    }

    pub fn from_entry(entry: Entry) -> Self {
        Self {
            dn: entry.dn.clone(),
            attributes: entry.into_attributes(),
            controls: Vec::new(),
        }
    }

    /// Pull the next record from an external entry producer.
    pub fn from_entry_source(source: &mut dyn EntrySource) -> Result<Option<Self>> {
        Ok(source.next_entry()?.map(Self::from_entry))
    }

    pub fn to_entry(&self) -> Entry {
        Entry::with_attributes(self.dn.clone(), self.attributes.clone())
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        match self.attributes.iter_mut().find(|a| a.name_matches(attribute.name())) {
            Some(existing) => {
                for v in attribute.values {
                    existing.add_value(v);
                }
            }
            None => self.attributes.push(attribute),
        }
    }

    pub fn add_value(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        self.add_attribute(Attribute::new(name, [value.into()]));
    }

    pub fn remove_attribute(&mut self, name: &str) -> bool {
        let before = self.attributes.len();
        self.attributes.retain(|a| !a.name_matches(name));
        before != self.attributes.len()
    }

    pub fn get_attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name_matches(name))
    }

    pub fn has_attribute(&self, attribute: &Attribute) -> bool {
        self.get_attribute(attribute.name()) == Some(attribute)
    }

    pub fn has_attribute_value(&self, name: &str, value: &[u8]) -> bool {
        self.get_attribute(name).map(|a| a.has_value(value)).unwrap_or(false)
    }

    pub fn has_attribute_value_with(&self, name: &str, value: &[u8], rule: &dyn MatchingRule) -> bool {
        self.get_attribute(name)
            .map(|a| a.has_value_with(value, rule))
            .unwrap_or(false)
    }

    pub fn validate(&self) -> Result<()> {
        validate_dn(&self.dn, "add request")?;
        validate_controls(&self.controls)
    }

    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// AddRequest ::= [APPLICATION 8] SEQUENCE { entry, attributes AttributeList }
    pub fn encode_protocol_op(&self) -> BerElement {
        BerElement::constructed(
            LDAP_TAG_ADD_REQUEST,
            vec![
                BerElement::octet_string(self.dn.as_bytes()),
                BerElement::sequence(self.attributes.iter().map(Attribute::encode)),
            ],
        )
    }

    fn decode_protocol_op(el: &BerElement) -> Result<Self> {
        let children = expect_children(el, 2, 2, "add request")?;
        let dn = decode_string(&children[0], "add request DN")?;
        expect_tag(&children[1], TAG_SEQUENCE, "add request attributes")?;
        let attributes = children[1]
            .children()?
            .iter()
            .map(Attribute::decode)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            dn,
            attributes,
            controls: Vec::new(),
        })
    }

    pub fn render(&self) -> String {
        let mut out = format!("dn: {}\nchangetype: add\n", self.dn);
        for attr in &self.attributes {
            render_attribute_lines(attr, &mut out);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub dn: String,
    pub modifications: Vec<Modification>,
    pub controls: Vec<Control>,
}

impl ModifyRequest {
    pub fn new<I: IntoIterator<Item = Modification>>(dn: impl Into<String>, modifications: I) -> Self {
        Self {
            dn: dn.into(),
            modifications: modifications.into_iter().collect(),
            controls: Vec::new(),
        }
    }

    pub fn add_modification(&mut self, modification: Modification) {
        self.modifications.push(modification);
    }

    pub fn validate(&self) -> Result<()> {
        validate_dn(&self.dn, "modify request")?;
        validate_controls(&self.controls)
    }

    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// ModifyRequest ::= [APPLICATION 6] SEQUENCE { object, changes SEQUENCE OF change }
    pub fn encode_protocol_op(&self) -> BerElement {
        BerElement::constructed(
            LDAP_TAG_MODIFY_REQUEST,
            vec![
                BerElement::octet_string(self.dn.as_bytes()),
                BerElement::sequence(self.modifications.iter().map(Modification::encode)),
            ],
        )
    }

    fn decode_protocol_op(el: &BerElement) -> Result<Self> {
        let children = expect_children(el, 2, 2, "modify request")?;
        let dn = decode_string(&children[0], "modify request DN")?;
        expect_tag(&children[1], TAG_SEQUENCE, "modify request changes")?;
        let modifications = children[1]
            .children()?
            .iter()
            .map(Modification::decode)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            dn,
            modifications,
            controls: Vec::new(),
        })
    }

    pub fn render(&self) -> String {
        let mut out = format!("dn: {}\nchangetype: modify\n", self.dn);
        for m in &self.modifications {
            out.push_str(&format!("{}: {}\n", m.mod_type.ldif_keyword(), m.attribute.name()));
            render_attribute_lines(&m.attribute, &mut out);
            out.push_str("-\n");
        }
        out
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct SimpleBindRequest {
    pub dn: String,
    pub password: Vec<u8>,
    pub controls: Vec<Control>,
}

impl SimpleBindRequest {
    pub fn new(dn: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        Self {
            dn: dn.into(),
            password: password.into(),
            controls: Vec::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new("", Vec::new())
    }

    pub fn is_anonymous(&self) -> bool {
        self.dn.is_empty() && self.password.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        validate_controls(&self.controls)
    }

    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// BindRequest ::= [APPLICATION 0] SEQUENCE { version, name, simple [0] OCTET STRING }
    pub fn encode_protocol_op(&self) -> BerElement {
        BerElement::constructed(
            LDAP_TAG_BIND_REQUEST,
            vec![
                BerElement::integer(LDAP_VERSION),
                BerElement::octet_string(self.dn.as_bytes()),
                BerElement::octet_string_with_tag(AUTH_SIMPLE, self.password.clone()),
            ],
        )
    }
}

// Password stays out of debug output.
impl fmt::Debug for SimpleBindRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleBindRequest")
            .field("dn", &self.dn)
            .field("password", &if self.password.is_empty() { "" } else { REDACTED_VALUE })
            .field("controls", &self.controls)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslBindRequest {
    pub dn: String,
    pub mechanism: String,
    pub credentials: Option<Vec<u8>>,
    pub controls: Vec<Control>,
}

impl SaslBindRequest {
    pub fn new(mechanism: impl Into<String>, credentials: Option<Vec<u8>>) -> Self {
        Self {
            dn: String::new(),
            mechanism: mechanism.into(),
            credentials,
            controls: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.mechanism.trim().is_empty() {
            return Err(LdapError::BindParameter("SASL mechanism name is required".to_string()));
        }
        validate_controls(&self.controls)
    }

    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// SaslCredentials ::= [3] SEQUENCE { mechanism, credentials OPTIONAL }
    pub fn encode_protocol_op(&self) -> BerElement {
        let mut sasl = vec![BerElement::octet_string(self.mechanism.as_bytes())];
        if let Some(ref c) = self.credentials {
            sasl.push(BerElement::octet_string(c.clone()));
        }
        BerElement::constructed(
            LDAP_TAG_BIND_REQUEST,
            vec![
                BerElement::integer(LDAP_VERSION),
                BerElement::octet_string(self.dn.as_bytes()),
                BerElement::constructed(AUTH_SASL, sasl),
            ],
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_dn: String,
    pub scope: SearchScope,
    pub deref_aliases: i32,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
    pub controls: Vec<Control>,
}

impl SearchRequest {
    pub fn new(base_dn: impl Into<String>, scope: SearchScope, filter: Filter) -> Self {
        Self {
            base_dn: base_dn.into(),
            scope,
            deref_aliases: 0,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter,
            attributes: Vec::new(),
            controls: Vec::new(),
        }
    }

    /// Base-scope read of a single entry.
    pub fn base_entry(dn: impl Into<String>, attributes: &[&str]) -> Self {
        let mut req = Self::new(dn, SearchScope::BaseObject, Filter::present("objectClass"));
        req.size_limit = 1;
        req.attributes = attributes.iter().map(|s| s.to_string()).collect();
        req
    }

    pub fn encode_protocol_op(&self) -> BerElement {
        BerElement::constructed(
            LDAP_TAG_SEARCH_REQUEST,
            vec![
                BerElement::octet_string(self.base_dn.as_bytes()),
                BerElement::enumerated(self.scope as i64),
                BerElement::enumerated(self.deref_aliases as i64),
                BerElement::integer(self.size_limit as i64),
                BerElement::integer(self.time_limit as i64),
                BerElement::boolean(self.types_only),
                self.filter.encode(),
                BerElement::sequence(self.attributes.iter().map(|a| BerElement::octet_string(a.as_bytes()))),
            ],
        )
    }

    fn decode_protocol_op(el: &BerElement) -> Result<Self> {
        let c = expect_children(el, 8, 8, "search request")?;
        let attributes = c[7]
            .children()?
            .iter()
            .map(|a| decode_string(a, "requested attribute"))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            base_dn: decode_string(&c[0], "search base")?,
            scope: SearchScope::try_from(c[1].as_integer()?)?,
            deref_aliases: c[2].as_i32()?,
            size_limit: c[3].as_i32()?,
            time_limit: c[4].as_i32()?,
            types_only: c[5].as_boolean()?,
            filter: Filter::decode(&c[6])?,
            attributes,
            controls: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub oid: String,
    pub value: Option<Vec<u8>>,
    pub controls: Vec<Control>,
}

impl ExtendedRequest {
    pub fn new(oid: impl Into<String>, value: Option<Vec<u8>>) -> Self {
        Self {
            oid: oid.into(),
            value,
            controls: Vec::new(),
        }
    }

    pub fn who_am_i() -> Self {
        Self::new(WHO_AM_I_OID, None)
    }

    pub fn encode_protocol_op(&self) -> BerElement {
        let mut children = vec![BerElement::octet_string_with_tag(EXTENDED_REQUEST_NAME, self.oid.as_bytes())];
        if let Some(ref v) = self.value {
            children.push(BerElement::octet_string_with_tag(EXTENDED_REQUEST_VALUE, v.clone()));
        }
        BerElement::constructed(LDAP_TAG_EXTENDED_REQUEST, children)
    }

    fn decode_protocol_op(el: &BerElement) -> Result<Self> {
        let c = expect_children(el, 1, 2, "extended request")?;
        expect_tag(&c[0], EXTENDED_REQUEST_NAME, "extended request name")?;
        let value = match c.get(1) {
            Some(v) => {
                expect_tag(v, EXTENDED_REQUEST_VALUE, "extended request value")?;
                Some(v.value().to_vec())
            }
            None => None,
        };
        Ok(Self {
            oid: c[0].as_string()?,
            value,
            controls: Vec::new(),
        })
    }
}

/// Every request the client can put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Add(AddRequest),
    Modify(ModifyRequest),
    SimpleBind(SimpleBindRequest),
    SaslBind(SaslBindRequest),
    Search(SearchRequest),
    Extended(ExtendedRequest),
    Unbind,
}

impl Request {
    pub fn controls(&self) -> &[Control] {
        match self {
            Request::Add(r) => &r.controls,
            Request::Modify(r) => &r.controls,
            Request::SimpleBind(r) => &r.controls,
            Request::SaslBind(r) => &r.controls,
            Request::Search(r) => &r.controls,
            Request::Extended(r) => &r.controls,
            Request::Unbind => &[],
        }
    }

    fn set_controls(&mut self, controls: Vec<Control>) -> Result<()> {
        match self {
            Request::Add(r) => r.controls = controls,
            Request::Modify(r) => r.controls = controls,
            Request::SimpleBind(r) => r.controls = controls,
            Request::SaslBind(r) => r.controls = controls,
            Request::Search(r) => r.controls = controls,
            Request::Extended(r) => r.controls = controls,
            Request::Unbind if controls.is_empty() => {}
            Request::Unbind => return Err(protocol_error("controls on unbind are not supported")),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Request::Add(r) => r.validate(),
            Request::Modify(r) => r.validate(),
            Request::SimpleBind(r) => r.validate(),
            Request::SaslBind(r) => r.validate(),
            Request::Search(r) => validate_controls(&r.controls),
            Request::Extended(r) => validate_controls(&r.controls),
            Request::Unbind => Ok(()),
        }
    }

    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    pub fn encode_protocol_op(&self) -> BerElement {
        match self {
            Request::Add(r) => r.encode_protocol_op(),
            Request::Modify(r) => r.encode_protocol_op(),
            Request::SimpleBind(r) => r.encode_protocol_op(),
            Request::SaslBind(r) => r.encode_protocol_op(),
            Request::Search(r) => r.encode_protocol_op(),
            Request::Extended(r) => r.encode_protocol_op(),
            Request::Unbind => BerElement::new(LDAP_TAG_UNBIND_REQUEST, Vec::new()),
        }
    }

    pub fn decode_protocol_op(el: &BerElement) -> Result<Self> {
        match el.tag() {
            LDAP_TAG_ADD_REQUEST => Ok(Request::Add(AddRequest::decode_protocol_op(el)?)),
            LDAP_TAG_MODIFY_REQUEST => Ok(Request::Modify(ModifyRequest::decode_protocol_op(el)?)),
            LDAP_TAG_BIND_REQUEST => decode_bind_request(el),
            LDAP_TAG_SEARCH_REQUEST => Ok(Request::Search(SearchRequest::decode_protocol_op(el)?)),
            LDAP_TAG_EXTENDED_REQUEST => Ok(Request::Extended(ExtendedRequest::decode_protocol_op(el)?)),
            LDAP_TAG_UNBIND_REQUEST => Ok(Request::Unbind),
            other => Err(protocol_error(format!("Unsupported LDAP request tag: 0x{:02X}", other))),
        }
    }

    /// LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }.
    /// Written through the streaming encoder.
    pub fn encode_message(&self, message_id: i32) -> Vec<u8> {
        let mut writer = BerWriter::new();
        let seq = writer.begin_sequence();
        writer.write_integer(message_id as i64);
        writer.write_element(&self.encode_protocol_op());
        if let Some(controls) = encode_controls(self.controls()) {
            writer.write_element(&controls);
        }
        writer.end_sequence(seq);
        writer.into_vec()
    }

    pub fn decode_message(data: &[u8]) -> Result<(i32, Request)> {
        let envelope = BerElement::decode(data)?;
        expect_tag(&envelope, TAG_SEQUENCE, "LDAP message")?;
        let children = expect_children(&envelope, 2, 3, "LDAP message")?;
        let message_id = children[0].as_i32()?;
        let mut request = Request::decode_protocol_op(&children[1])?;
        if let Some(c) = children.get(2) {
            expect_tag(c, LDAP_CONTEXT_CONTROLS, "message controls")?;
            request.set_controls(decode_controls(c)?)?;
        }
        Ok((message_id, request))
    }

    /// Human-readable form. Sensitive attribute values are redacted; the wire
    /// encoding is never affected.
    pub fn render(&self) -> String {
        match self {
            Request::Add(r) => r.render(),
            Request::Modify(r) => r.render(),
            Request::SimpleBind(r) => format!("SimpleBindRequest(dn='{}')", r.dn),
            Request::SaslBind(r) => format!("SASLBindRequest(mechanism='{}')", r.mechanism),
            Request::Search(r) => format!(
                "SearchRequest(baseDN='{}', scope={:?}, filter='{}')",
                r.base_dn, r.scope, r.filter
            ),
            Request::Extended(r) => format!("ExtendedRequest(oid='{}')", r.oid),
            Request::Unbind => "UnbindRequest()".to_string(),
        }
    }
}

fn decode_bind_request(el: &BerElement) -> Result<Request> {
    let c = expect_children(el, 3, 3, "bind request")?;
    let version = c[0].as_integer()?;
    if version != LDAP_VERSION {
        return Err(protocol_error(format!("unsupported LDAP version {}", version)));
    }
    let dn = decode_string(&c[1], "bind DN")?;
    match c[2].tag() {
        AUTH_SIMPLE => Ok(Request::SimpleBind(SimpleBindRequest::new(dn, c[2].value().to_vec()))),
        AUTH_SASL => {
            let sasl = expect_children(&c[2], 1, 2, "SASL credentials")?;
            let mut req = SaslBindRequest::new(
                decode_string(&sasl[0], "SASL mechanism")?,
                sasl.get(1).map(|v| v.value().to_vec()),
            );
            req.dn = dn;
            Ok(Request::SaslBind(req))
        }
        other => Err(protocol_error(format!("unsupported bind authentication tag 0x{:02X}", other))),
    }
}

fn render_attribute_lines(attr: &Attribute, out: &mut String) {
    let redact = is_sensitive_attribute(attr.name());
    let count = attr.values().len();
    for (i, v) in attr.values().iter().enumerate() {
        if redact {
            if count > 1 {
                out.push_str(&format!("{}: ---redacted-value-{}---\n", attr.name(), i + 1));
            } else {
                out.push_str(&format!("{}: {}\n", attr.name(), REDACTED_VALUE));
            }
        } else if is_safe_ldif_value(v) {
            out.push_str(&format!("{}: {}\n", attr.name(), String::from_utf8_lossy(v)));
        } else {
            let encoded = base64::engine::general_purpose::STANDARD.encode(v);
            out.push_str(&format!("{}:: {}\n", attr.name(), encoded));
        }
    }
}

fn is_safe_ldif_value(v: &[u8]) -> bool {
    if !ber::is_printable(v) {
        return false;
    }
    !matches!(v.first(), Some(b' ') | Some(b':') | Some(b'<')) && v.last() != Some(&b' ')
}

/// LDAPResult components shared by all response types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referrals: Vec<String>,
}

impl LdapResult {
    pub fn new(code: ResultCode, matched_dn: impl Into<String>, diagnostic_message: impl Into<String>) -> Self {
        Self {
            code,
            matched_dn: matched_dn.into(),
            diagnostic_message: diagnostic_message.into(),
            referrals: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(ResultCode::SUCCESS, "", "")
    }

    /// Convert a non-success result into an error.
    pub fn into_result(self) -> Result<LdapResult> {
        if self.code.is_success() {
            Ok(self)
        } else {
            Err(LdapError::Result {
                code: self.code,
                matched_dn: self.matched_dn,
                message: self.diagnostic_message,
            })
        }
    }

    fn encode_children(&self) -> Vec<BerElement> {
        let mut out = vec![
            BerElement::enumerated(self.code.0 as i64),
            BerElement::octet_string(self.matched_dn.as_bytes()),
            BerElement::octet_string(self.diagnostic_message.as_bytes()),
        ];
        if !self.referrals.is_empty() {
            out.push(BerElement::constructed(
                REFERRAL,
                self.referrals.iter().map(|r| BerElement::octet_string(r.as_bytes())),
            ));
        }
        out
    }

    /// Parse the leading LDAPResult elements; returns the result and the rest.
    fn decode_children(children: &[BerElement], what: &str) -> Result<(Self, usize)> {
        if children.len() < 3 {
            return Err(protocol_error(format!(
                "{} must contain at least 3 elements, got {}",
                what,
                children.len()
            )));
        }
        expect_tag(&children[0], ber::TAG_ENUMERATED, "result code")?;
        let mut result = LdapResult::new(
            ResultCode(children[0].as_i32()?),
            decode_string(&children[1], "matched DN")?,
            decode_string(&children[2], "diagnostic message")?,
        );
        let mut used = 3;
        if let Some(r) = children.get(3) {
            if r.tag() == REFERRAL {
                result.referrals = r
                    .children()?
                    .iter()
                    .map(|u| decode_string(u, "referral URL"))
                    .collect::<Result<Vec<_>>>()?;
                used = 4;
            }
        }
        Ok((result, used))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Bind {
        result: LdapResult,
        server_sasl_credentials: Option<Vec<u8>>,
    },
    SearchEntry(Entry),
    SearchReference(Vec<String>),
    SearchDone(LdapResult),
    Add(LdapResult),
    Modify(LdapResult),
    Extended {
        result: LdapResult,
        name: Option<String>,
        value: Option<Vec<u8>>,
    },
    Intermediate {
        name: Option<String>,
        value: Option<Vec<u8>>,
    },
    /// Delete, ModifyDN and Compare responses carry only an LDAPResult.
    Other { tag: u8, result: LdapResult },
}

impl Response {
    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            Response::Bind { result, .. }
            | Response::SearchDone(result)
            | Response::Add(result)
            | Response::Modify(result)
            | Response::Extended { result, .. }
            | Response::Other { result, .. } => Some(result),
            Response::SearchEntry(_) | Response::SearchReference(_) | Response::Intermediate { .. } => None,
        }
    }

    pub fn encode_protocol_op(&self) -> BerElement {
        match self {
            Response::Bind {
                result,
                server_sasl_credentials,
            } => {
                let mut c = result.encode_children();
                if let Some(ref creds) = server_sasl_credentials {
                    c.push(BerElement::octet_string_with_tag(SERVER_SASL_CREDS, creds.clone()));
                }
                BerElement::constructed(LDAP_TAG_BIND_RESPONSE, c)
            }
            Response::SearchEntry(entry) => BerElement::constructed(
                LDAP_TAG_SEARCH_RESULT_ENTRY,
                vec![
                    BerElement::octet_string(entry.dn().as_bytes()),
                    BerElement::sequence(entry.attributes().iter().map(Attribute::encode)),
                ],
            ),
            Response::SearchReference(urls) => BerElement::constructed(
                LDAP_TAG_SEARCH_RESULT_REFERENCE,
                urls.iter().map(|u| BerElement::octet_string(u.as_bytes())),
            ),
            Response::SearchDone(r) => BerElement::constructed(LDAP_TAG_SEARCH_RESULT_DONE, r.encode_children()),
            Response::Add(r) => BerElement::constructed(LDAP_TAG_ADD_RESPONSE, r.encode_children()),
            Response::Modify(r) => BerElement::constructed(LDAP_TAG_MODIFY_RESPONSE, r.encode_children()),
            Response::Extended { result, name, value } => {
                let mut c = result.encode_children();
                if let Some(ref n) = name {
                    c.push(BerElement::octet_string_with_tag(EXTENDED_RESPONSE_NAME, n.as_bytes()));
                }
                if let Some(ref v) = value {
                    c.push(BerElement::octet_string_with_tag(EXTENDED_RESPONSE_VALUE, v.clone()));
                }
                BerElement::constructed(LDAP_TAG_EXTENDED_RESPONSE, c)
            }
            Response::Intermediate { name, value } => {
                let mut c = Vec::new();
                if let Some(ref n) = name {
                    c.push(BerElement::octet_string_with_tag(0x80, n.as_bytes()));
                }
                if let Some(ref v) = value {
                    c.push(BerElement::octet_string_with_tag(0x81, v.clone()));
                }
                BerElement::constructed(LDAP_TAG_INTERMEDIATE_RESPONSE, c)
            }
            Response::Other { tag, result } => BerElement::constructed(*tag, result.encode_children()),
        }
    }

    pub fn decode_protocol_op(el: &BerElement) -> Result<Self> {
        let children = el.children()?;
        match el.tag() {
            LDAP_TAG_BIND_RESPONSE => {
                let (result, used) = LdapResult::decode_children(&children, "bind response")?;
                let server_sasl_credentials = match children.get(used) {
                    Some(c) if c.tag() == SERVER_SASL_CREDS => Some(c.value().to_vec()),
                    Some(c) => {
                        return Err(protocol_error(format!(
                            "unexpected element 0x{:02X} in bind response",
                            c.tag()
                        )))
                    }
                    None => None,
                };
                Ok(Response::Bind {
                    result,
                    server_sasl_credentials,
                })
            }
            LDAP_TAG_SEARCH_RESULT_ENTRY => {
                let c = expect_children(el, 2, 2, "search result entry")?;
                let dn = decode_string(&c[0], "entry DN")?;
                expect_tag(&c[1], TAG_SEQUENCE, "entry attributes")?;
                let attributes = c[1]
                    .children()?
                    .iter()
                    .map(Attribute::decode)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Response::SearchEntry(Entry::with_attributes(dn, attributes)))
            }
            LDAP_TAG_SEARCH_RESULT_REFERENCE => Ok(Response::SearchReference(
                children
                    .iter()
                    .map(|u| decode_string(u, "reference URL"))
                    .collect::<Result<Vec<_>>>()?,
            )),
            LDAP_TAG_SEARCH_RESULT_DONE => Ok(Response::SearchDone(
                LdapResult::decode_children(&children, "search result done")?.0,
            )),
            LDAP_TAG_ADD_RESPONSE => Ok(Response::Add(LdapResult::decode_children(&children, "add response")?.0)),
            LDAP_TAG_MODIFY_RESPONSE => Ok(Response::Modify(
                LdapResult::decode_children(&children, "modify response")?.0,
            )),
            LDAP_TAG_EXTENDED_RESPONSE => {
                let (result, used) = LdapResult::decode_children(&children, "extended response")?;
                let mut name = None;
                let mut value = None;
                for c in &children[used..] {
                    match c.tag() {
                        EXTENDED_RESPONSE_NAME => name = Some(c.as_string()?),
                        EXTENDED_RESPONSE_VALUE => value = Some(c.value().to_vec()),
                        other => {
                            return Err(protocol_error(format!(
                                "unexpected element 0x{:02X} in extended response",
                                other
                            )))
                        }
                    }
                }
                Ok(Response::Extended { result, name, value })
            }
            LDAP_TAG_INTERMEDIATE_RESPONSE => {
                let mut name = None;
                let mut value = None;
                for c in &children {
                    match c.tag() {
                        0x80 => name = Some(c.as_string()?),
                        0x81 => value = Some(c.value().to_vec()),
                        other => {
                            return Err(protocol_error(format!(
                                "unexpected element 0x{:02X} in intermediate response",
                                other
                            )))
                        }
                    }
                }
                Ok(Response::Intermediate { name, value })
            }
            tag @ (LDAP_TAG_DEL_RESPONSE | LDAP_TAG_MODIFY_DN_RESPONSE | LDAP_TAG_COMPARE_RESPONSE) => Ok(Response::Other {
                tag,
                result: LdapResult::decode_children(&children, "response")?.0,
            }),
            other => Err(protocol_error(format!("Unsupported LDAP response tag: 0x{:02X}", other))),
        }
    }
}

/// A decoded message received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMessage {
    pub message_id: i32,
    pub response: Response,
    pub controls: Vec<Control>,
}

impl ResponseMessage {
    pub fn new(message_id: i32, response: Response) -> Self {
        Self {
            message_id,
            response,
            controls: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut children = vec![
            BerElement::integer(self.message_id as i64),
            self.response.encode_protocol_op(),
        ];
        if let Some(c) = encode_controls(&self.controls) {
            children.push(c);
        }
        BerElement::sequence(children).encode()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let envelope = BerElement::decode(data)?;
        expect_tag(&envelope, TAG_SEQUENCE, "LDAP message")?;
        let children = expect_children(&envelope, 2, 3, "LDAP message")?;
        let message_id = children[0].as_i32()?;
        let response = Response::decode_protocol_op(&children[1])?;
        let controls = match children.get(2) {
            Some(c) => {
                expect_tag(c, LDAP_CONTEXT_CONTROLS, "message controls")?;
                decode_controls(c)?
            }
            None => Vec::new(),
        };
        Ok(Self {
            message_id,
            response,
            controls,
        })
    }

    /// Unsolicited notifications use message ID 0.
    pub fn is_notice_of_disconnection(&self) -> bool {
        self.message_id == 0
            && matches!(&self.response, Response::Extended { name: Some(n), .. } if n == NOTICE_OF_DISCONNECTION_OID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of<T: Hash>(t: &T) -> u64 {
        let mut h = DefaultHasher::new();
        t.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_attribute_equality_ignores_order_and_case() {
        let a = Attribute::new("cn", ["a", "b"]);
        let b = Attribute::new("CN", ["b", "a"]);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, Attribute::new("cn", ["a"]));
        assert_ne!(a, Attribute::new("sn", ["a", "b"]));
    }

    #[test]
    fn test_attribute_string_and_byte_values_normalize() {
        let from_str = Attribute::new("description", ["hello"]);
        let from_bytes = Attribute::new("description", [b"hello".to_vec()]);
        assert_eq!(from_str, from_bytes);
        let mut dup = Attribute::new("description", ["x", "x"]);
        assert_eq!(dup.len(), 1);
        assert!(!dup.add_value("x"));
        assert!(dup.remove_value(b"x"));
        assert!(dup.is_empty());
    }

    #[test]
    fn test_value_matching_levels() {
        let attr = Attribute::new("cn", ["John Doe"]);
        assert!(attr.has_value(b"John Doe"));
        assert!(!attr.has_value(b"john doe"));
        assert!(attr.has_value_ignore_case("JOHN   doe"));
        let prefix = |stored: &[u8], wanted: &[u8]| stored.starts_with(wanted);
        assert!(attr.has_value_with(b"John", &prefix));
    }

    #[test]
    fn test_has_attribute_requires_exact_value_set() {
        let req = AddRequest::new(
            "cn=test,dc=example,dc=com",
            vec![
                Attribute::new("objectClass", ["top", "person"]),
                Attribute::new("cn", ["test"]),
            ],
        );
        assert!(req.has_attribute(&Attribute::new("objectclass", ["person", "top"])));
        assert!(!req.has_attribute(&Attribute::new("objectClass", ["top"])));
        assert!(!req.has_attribute(&Attribute::new("objectClass", ["top", "person", "extra"])));
        assert!(req.has_attribute_value("CN", b"test"));
    }

    #[test]
    fn test_entry_merges_attributes() {
        let mut entry = Entry::new("uid=a,dc=example,dc=com");
        entry.add_attribute(Attribute::new("mail", ["a@example.com"]));
        entry.add_value("MAIL", "b@example.com");
        assert_eq!(entry.attributes().len(), 1);
        assert_eq!(entry.get_attribute("mail").unwrap().len(), 2);
        assert!(entry.has_attribute_value_ignore_case("mail", "A@EXAMPLE.COM"));
        assert!(entry.remove_attribute("Mail").is_some());
        assert!(!entry.has_attribute_named("mail"));
    }

    #[test]
    fn test_modification_round_trip_and_hash() {
        let mods = vec![
            Modification::with_values(ModificationType::Add, "mail", ["a@example.com", "b@example.com"]),
            Modification::with_values(ModificationType::Delete, "description", Vec::<Vec<u8>>::new()),
            Modification::with_values(ModificationType::Replace, "cn", ["x"]),
            Modification::with_values(ModificationType::Increment, "uidNumber", ["1"]),
            Modification::with_values(ModificationType::Unknown(42), "foo", [vec![0u8, 1, 2]]),
        ];
        for m in mods {
            let decoded = Modification::decode(&BerElement::decode(&m.encode().encode()).unwrap()).unwrap();
            assert_eq!(decoded, m);
            assert_eq!(hash_of(&decoded), hash_of(&m));
        }
    }

    #[test]
    fn test_modification_values_unordered() {
        let a = Modification::with_values(ModificationType::Replace, "mail", ["x", "y"]);
        let b = Modification::with_values(ModificationType::Replace, "MAIL", ["y", "x"]);
        assert_eq!(a, b);
        assert_ne!(a, Modification::with_values(ModificationType::Add, "mail", ["x", "y"]));
    }

    #[test]
    fn test_modification_values_keep_duplicates() {
        let twice = Modification::with_values(ModificationType::Add, "mail", ["x", "x"]);
        let once = Modification::with_values(ModificationType::Add, "mail", ["x"]);
        assert_eq!(twice.attribute.len(), 2);
        assert_ne!(twice, once);
        assert_ne!(
            Modification::with_values(ModificationType::Add, "mail", ["x", "x", "y"]),
            Modification::with_values(ModificationType::Add, "mail", ["x", "y", "y"])
        );

        let decoded = Modification::decode(&BerElement::decode(&twice.encode().encode()).unwrap()).unwrap();
        assert_eq!(decoded.attribute.len(), 2);
        assert_eq!(decoded, twice);
        assert_eq!(hash_of(&decoded), hash_of(&twice));

        // entry attributes stay sets
        assert_eq!(Attribute::new("mail", ["x", "x"]).len(), 1);
    }

    #[test]
    fn test_modification_decode_rejects_wrong_shape() {
        let bad = BerElement::sequence(vec![BerElement::enumerated(0)]);
        assert!(matches!(Modification::decode(&bad), Err(LdapError::Protocol(_))));
        let wrong_tag = BerElement::sequence(vec![
            BerElement::integer(0),
            Attribute::new("cn", ["x"]).encode(),
        ]);
        assert!(matches!(Modification::decode(&wrong_tag), Err(LdapError::Protocol(_))));
    }

    #[test]
    fn test_add_request_message_round_trip() {
        let mut req = AddRequest::new(
            "cn=test,dc=example,dc=com",
            vec![
                Attribute::new("objectClass", ["top", "person"]),
                Attribute::new("sn", ["Test"]),
            ],
        );
        req.controls.push(Control::new("1.2.3.4", true, Some(vec![1, 2, 3])));
        let request = Request::Add(req);
        let bytes = request.encode_message(7);
        let (id, decoded) = Request::decode_message(&bytes).unwrap();
        assert_eq!(id, 7);
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_streaming_message_matches_tree_encoding() {
        let request = Request::Modify(ModifyRequest::new(
            "uid=jdoe,ou=People,dc=example,dc=com",
            vec![Modification::with_values(
                ModificationType::Replace,
                "description",
                [vec![b'z'; 300]],
            )],
        ));
        let tree = BerElement::sequence(vec![BerElement::integer(99), request.encode_protocol_op()]);
        assert_eq!(request.encode_message(99), tree.encode());
    }

    #[test]
    fn test_duplicate_is_independent() {
        let original = AddRequest::new("cn=a,dc=example,dc=com", vec![Attribute::new("cn", ["a"])]);
        let mut copy = original.duplicate();
        copy.add_value("cn", "b");
        copy.dn = "cn=b,dc=example,dc=com".to_string();
        assert_eq!(original.get_attribute("cn").unwrap().len(), 1);
        assert_eq!(original.dn, "cn=a,dc=example,dc=com");

        let mut original = original;
        original.add_value("description", "only in original");
        assert!(!copy.has_attribute_value("description", b"only in original"));

        let mut m = ModifyRequest::new("cn=a", vec![]);
        let m2 = m.duplicate();
        m.add_modification(Modification::with_values(ModificationType::Add, "cn", ["x"]));
        assert!(m2.modifications.is_empty());
    }

    #[test]
    fn test_validate() {
        assert!(matches!(
            AddRequest::new("", Vec::new()).validate(),
            Err(LdapError::Parameter(_))
        ));
        assert!(AddRequest::new("cn=x", Vec::new()).validate().is_ok());
        assert!(ModifyRequest::new("cn=x", Vec::new()).validate().is_ok());
        assert!(matches!(
            ModifyRequest::new(" ", Vec::new()).validate(),
            Err(LdapError::Parameter(_))
        ));
        let mut bad_control = ModifyRequest::new("cn=x", Vec::new());
        bad_control.controls.push(Control::new(" ", false, None));
        let err = bad_control.validate().unwrap_err();
        assert!(matches!(err, LdapError::Parameter(_)));
        assert!(err.to_string().starts_with("invalid request"));
        assert!(matches!(
            SaslBindRequest::new("", None).validate(),
            Err(LdapError::BindParameter(_))
        ));
    }

    #[test]
    fn test_control_equality_and_round_trip() {
        let a = Control::new("1.2.840.113556.1.4.319", true, Some(vec![0x30, 0x00]));
        assert_eq!(a, Control::new("1.2.840.113556.1.4.319", true, Some(vec![0x30, 0x00])));
        assert_ne!(a, Control::new("1.2.840.113556.1.4.319", false, Some(vec![0x30, 0x00])));
        assert_ne!(a, Control::new("1.2.840.113556.1.4.319", true, None));
        assert_eq!(Control::decode(&a.encode()).unwrap(), a);

        let plain = Control::new("1.2.3", false, None);
        assert_eq!(plain.encode().encode(), vec![0x30, 0x07, 0x04, 0x05, b'1', b'.', b'2', b'.', b'3']);
    }

    #[test]
    fn test_redaction_only_in_rendered_output() {
        let req = AddRequest::new(
            "uid=jdoe,dc=example,dc=com",
            vec![
                Attribute::new("objectClass", ["top", "person"]),
                Attribute::new("userPassword", ["secret123"]),
            ],
        );
        let rendered = req.render();
        assert!(rendered.contains("userPassword: ---redacted-value---"));
        assert!(!rendered.contains("secret123"));

        let wire = req.encode_protocol_op().encode();
        assert!(wire.windows(9).any(|w| w == b"secret123"));
        assert!(!wire.windows(REDACTED_VALUE.len()).any(|w| w == REDACTED_VALUE.as_bytes()));
    }

    #[test]
    fn test_redaction_numbers_multiple_values() {
        let req = ModifyRequest::new(
            "uid=jdoe",
            vec![Modification::with_values(ModificationType::Replace, "userPassword;binary", ["one", "two"])],
        );
        let rendered = req.render();
        assert!(rendered.contains("userPassword;binary: ---redacted-value-1---"));
        assert!(rendered.contains("userPassword;binary: ---redacted-value-2---"));
        assert!(!rendered.contains("one"));
    }

    #[test]
    fn test_render_base64_for_binary() {
        let req = AddRequest::new("cn=bin", vec![Attribute::new("jpegPhoto", [vec![0xFFu8, 0xD8, 0x00]])]);
        assert!(req.render().contains("jpegPhoto:: /9gA"));
    }

    #[test]
    fn test_simple_bind_debug_hides_password() {
        let req = SimpleBindRequest::new("cn=Manager", "topsecret");
        let dbg = format!("{:?}", req);
        assert!(!dbg.contains("topsecret"));
        assert!(SimpleBindRequest::anonymous().is_anonymous());
    }

    #[test]
    fn test_bind_requests_round_trip() {
        let simple = Request::SimpleBind(SimpleBindRequest::new("cn=Manager", "pw"));
        assert_eq!(Request::decode_message(&simple.encode_message(1)).unwrap().1, simple);

        let sasl = Request::SaslBind(SaslBindRequest::new("GSSAPI", Some(vec![1, 2, 3])));
        assert_eq!(Request::decode_message(&sasl.encode_message(2)).unwrap().1, sasl);
    }

    #[test]
    fn test_response_round_trip() {
        let entry = Entry::with_attributes("cn=x,dc=example,dc=com", vec![Attribute::new("cn", ["x"])]);
        let responses = vec![
            Response::Bind {
                result: LdapResult::new(ResultCode::SASL_BIND_IN_PROGRESS, "", ""),
                server_sasl_credentials: Some(vec![9, 9]),
            },
            Response::SearchEntry(entry),
            Response::SearchDone(LdapResult::new(ResultCode::NO_SUCH_OBJECT, "dc=example,dc=com", "missing")),
            Response::Extended {
                result: LdapResult::success(),
                name: None,
                value: Some(b"dn:cn=x".to_vec()),
            },
        ];
        for (i, r) in responses.into_iter().enumerate() {
            let msg = ResponseMessage::new(i as i32 + 1, r);
            assert_eq!(ResponseMessage::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn test_response_decode_errors() {
        // bind response with only two LDAPResult components
        let short = BerElement::sequence(vec![
            BerElement::integer(1),
            BerElement::constructed(
                LDAP_TAG_BIND_RESPONSE,
                vec![BerElement::enumerated(0), BerElement::octet_string("")],
            ),
        ]);
        assert!(matches!(ResponseMessage::decode(&short.encode()), Err(LdapError::Protocol(_))));
        // truncated buffer surfaces as a decode error
        let bytes = ResponseMessage::new(1, Response::Add(LdapResult::success())).encode();
        assert!(matches!(
            ResponseMessage::decode(&bytes[..bytes.len() - 1]),
            Err(LdapError::Decode(_))
        ));
    }

    #[test]
    fn test_notice_of_disconnection() {
        let notice = ResponseMessage::new(
            0,
            Response::Extended {
                result: LdapResult::new(ResultCode::UNAVAILABLE, "", "shutting down"),
                name: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
                value: None,
            },
        );
        assert!(notice.is_notice_of_disconnection());
    }

    #[test]
    fn test_add_request_from_entry_source() {
        let mut source = vec![
            Entry::with_attributes("cn=one", vec![Attribute::new("cn", ["one"])]),
            Entry::with_attributes("cn=two", vec![Attribute::new("cn", ["two"])]),
        ]
        .into_iter();
        let first = AddRequest::from_entry_source(&mut source).unwrap().unwrap();
        assert_eq!(first.dn, "cn=one");
        assert_eq!(first.to_entry().get_attribute("cn").unwrap().first_value_string().unwrap(), "one");
        assert!(AddRequest::from_entry_source(&mut source).unwrap().is_some());
        assert!(AddRequest::from_entry_source(&mut source).unwrap().is_none());
    }
}
