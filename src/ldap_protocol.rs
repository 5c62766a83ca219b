// LDAP protocol handling with BER encoding/decoding
// Implements the LDAPv3 message subset the directory serves (RFC 4511)

use anyhow::{bail, Context, Result};
use std::fmt;

use crate::value::BerLength;

/// OID for StartTLS extended operation (RFC 4511).
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";

// Filters nested deeper than this are rejected.
const MAX_FILTER_DEPTH: usize = 64;

// LDAP Control (request or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub ctype: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

// LDAP Message structure
#[derive(Debug, Clone)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Option<Vec<Control>>,
}

#[derive(Debug, Clone)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(LdapResult),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultDone(LdapResult),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DelRequest(DelRequest),
    DelResponse(LdapResult),
    ModifyDNRequest(ModifyDNRequest),
    ModifyDNResponse(LdapResult),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
}

impl ProtocolOp {
    /// Short operation name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) | ProtocolOp::BindResponse(_) => "bind",
            ProtocolOp::UnbindRequest => "unbind",
            ProtocolOp::SearchRequest(_)
            | ProtocolOp::SearchResultEntry(_)
            | ProtocolOp::SearchResultDone(_) => "search",
            ProtocolOp::ModifyRequest(_) | ProtocolOp::ModifyResponse(_) => "modify",
            ProtocolOp::AddRequest(_) | ProtocolOp::AddResponse(_) => "add",
            ProtocolOp::DelRequest(_) | ProtocolOp::DelResponse(_) => "delete",
            ProtocolOp::ModifyDNRequest(_) | ProtocolOp::ModifyDNResponse(_) => "modify_dn",
            ProtocolOp::CompareRequest(_) | ProtocolOp::CompareResponse(_) => "compare",
            ProtocolOp::AbandonRequest(_) => "abandon",
            ProtocolOp::ExtendedRequest(_) | ProtocolOp::ExtendedResponse(_) => "extended",
        }
    }
}

/// LDAP result codes used by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    NoSuchObject = 32,
    InvalidDnSyntax = 34,
    InvalidCredentials = 49,
    UnwillingToPerform = 53,
    EntryAlreadyExists = 68,
    Other = 80,
}

impl ResultCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultCode::Success => "success",
            ResultCode::OperationsError => "operationsError",
            ResultCode::ProtocolError => "protocolError",
            ResultCode::NoSuchObject => "noSuchObject",
            ResultCode::InvalidDnSyntax => "invalidDNSyntax",
            ResultCode::InvalidCredentials => "invalidCredentials",
            ResultCode::UnwillingToPerform => "unwillingToPerform",
            ResultCode::EntryAlreadyExists => "entryAlreadyExists",
            ResultCode::Other => "other",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

/// LDAPResult components shared by every response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
}

impl LdapResult {
    pub fn new(code: ResultCode, diagnostic_message: impl Into<String>) -> Self {
        Self {
            code,
            matched_dn: String::new(),
            diagnostic_message: diagnostic_message.into(),
        }
    }

    pub fn success() -> Self {
        Self::new(ResultCode::Success, "")
    }
}

#[derive(Debug, Clone)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone)]
pub enum BindAuthentication {
    Simple(Vec<u8>),
    Sasl { mechanism: String, credentials: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: u8,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<u8> for SearchScope {
    type Error = anyhow::Error;
    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => bail!("Invalid search scope: {}", value),
        }
    }
}

impl fmt::Display for SearchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SearchScope::BaseObject => "base",
            SearchScope::SingleLevel => "one",
            SearchScope::WholeSubtree => "sub",
        })
    }
}

/// Search filter as sent by the client. Only rendered, never evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    EqualityMatch { attr: String, value: Vec<u8> },
    Substrings {
        attr: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        final_: Option<Vec<u8>>,
    },
    GreaterOrEqual { attr: String, value: Vec<u8> },
    LessOrEqual { attr: String, value: Vec<u8> },
    Present(String),
    ApproxMatch { attr: String, value: Vec<u8> },
    ExtensibleMatch {
        matching_rule: Option<String>,
        attr: Option<String>,
        value: Vec<u8>,
        dn_attributes: bool,
    },
}

impl Filter {
    /// RFC 4515 string form.
    pub fn to_ldap_string(&self) -> String {
        let mut out = String::new();
        self.render(&mut out);
        out
    }

    fn render(&self, out: &mut String) {
        out.push('(');
        match self {
            Filter::And(items) => {
                out.push('&');
                items.iter().for_each(|f| f.render(out));
            }
            Filter::Or(items) => {
                out.push('|');
                items.iter().for_each(|f| f.render(out));
            }
            Filter::Not(inner) => {
                out.push('!');
                inner.render(out);
            }
            Filter::EqualityMatch { attr, value } => {
                out.push_str(attr);
                out.push('=');
                escape_filter_value(value, out);
            }
            Filter::Substrings { attr, initial, any, final_ } => {
                out.push_str(attr);
                out.push('=');
                if let Some(v) = initial {
                    escape_filter_value(v, out);
                }
                out.push('*');
                for v in any {
                    escape_filter_value(v, out);
                    out.push('*');
                }
                if let Some(v) = final_ {
                    escape_filter_value(v, out);
                }
            }
            Filter::GreaterOrEqual { attr, value } => {
                out.push_str(attr);
                out.push_str(">=");
                escape_filter_value(value, out);
            }
            Filter::LessOrEqual { attr, value } => {
                out.push_str(attr);
                out.push_str("<=");
                escape_filter_value(value, out);
            }
            Filter::Present(attr) => {
                out.push_str(attr);
                out.push_str("=*");
            }
            Filter::ApproxMatch { attr, value } => {
                out.push_str(attr);
                out.push_str("~=");
                escape_filter_value(value, out);
            }
            Filter::ExtensibleMatch { matching_rule, attr, value, dn_attributes } => {
                if let Some(a) = attr {
                    out.push_str(a);
                }
                if *dn_attributes {
                    out.push_str(":dn");
                }
                if let Some(rule) = matching_rule {
                    out.push(':');
                    out.push_str(rule);
                }
                out.push_str(":=");
                escape_filter_value(value, out);
            }
        }
        out.push(')');
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_ldap_string())
    }
}

fn escape_filter_value(value: &[u8], out: &mut String) {
    match std::str::from_utf8(value) {
        Ok(s) => {
            for c in s.chars() {
                match c {
                    '*' | '(' | ')' | '\\' | '\0' => out.push_str(&format!("\\{:02x}", c as u32)),
                    _ => out.push(c),
                }
            }
        }
        Err(_) => {
            for b in value {
                out.push_str(&format!("\\{:02x}", b));
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

#[derive(Debug, Clone)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct DelRequest {
    pub entry: String,
}

#[derive(Debug, Clone)]
pub struct ModifyDNRequest {
    pub entry: String,
    pub newrdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompareRequest {
    pub entry: String,
    pub attr: String,
    pub assertion_value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

// BER parsing utilities. Every constructed element is read through a
// sub-reader bounded to its own contents.
pub(crate) struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn read_tag(&mut self) -> Result<u8> {
        let tag = self.peek_tag().context("BER truncated: expected tag")?;
        if tag & 0x1F == 0x1F {
            bail!("Multi-byte BER tags not supported: 0x{:02X}", tag);
        }
        self.pos += 1;
        Ok(tag)
    }

    fn read_length(&mut self) -> Result<usize> {
        let length = BerLength::parse(&self.data[self.pos..])?;
        self.pos += length.encoded_len();
        Ok(length.definite()?)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            bail!("BER truncated: need {} bytes, {} remaining", n, self.remaining());
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    /// Read one TLV, returning its tag and contents.
    fn read_element(&mut self) -> Result<(u8, &'a [u8])> {
        let tag = self.read_tag()?;
        let length = self.read_length()?;
        let contents = self.read_bytes(length)?;
        Ok((tag, contents))
    }

    /// Read a constructed element with the given tag and return a reader over its contents.
    fn read_constructed(&mut self, expected: u8) -> Result<BerReader<'a>> {
        let (tag, contents) = self.read_element()?;
        if tag != expected {
            bail!("Expected tag 0x{:02X}, got: 0x{:02X}", expected, tag);
        }
        Ok(BerReader::new(contents))
    }

    fn read_sequence(&mut self) -> Result<BerReader<'a>> {
        self.read_constructed(0x30)
    }

    /// SET and SEQUENCE are both accepted for attribute value lists.
    fn read_set_or_sequence(&mut self) -> Result<BerReader<'a>> {
        let (tag, contents) = self.read_element()?;
        if tag != 0x30 && tag != 0x31 {
            bail!("Expected SET or SEQUENCE, got: 0x{:02X}", tag);
        }
        Ok(BerReader::new(contents))
    }

    fn read_integer(&mut self) -> Result<i32> {
        let (tag, contents) = self.read_element()?;
        if tag != 0x02 {
            bail!("Expected INTEGER tag (0x02), got: 0x{:02X}", tag);
        }
        decode_integer(contents)
    }

    fn read_enumerated(&mut self) -> Result<u8> {
        let (tag, contents) = self.read_element()?;
        if tag != 0x0A {
            bail!("Expected ENUMERATED tag, got: 0x{:02X}", tag);
        }
        if contents.len() != 1 {
            bail!("Enumerated value must be 1 byte, got: {}", contents.len());
        }
        Ok(contents[0])
    }

    fn read_boolean(&mut self) -> Result<bool> {
        let (tag, contents) = self.read_element()?;
        if tag != 0x01 {
            bail!("Expected BOOLEAN tag, got: 0x{:02X}", tag);
        }
        if contents.len() != 1 {
            bail!("Boolean value must be 1 byte, got: {}", contents.len());
        }
        Ok(contents[0] != 0)
    }

    /// Read OCTET STRING TLV. Accepts 0x04 (universal) or a primitive context-specific tag.
    fn read_octet_string(&mut self) -> Result<Vec<u8>> {
        let (tag, contents) = self.read_element()?;
        if tag != 0x04 && !(0x80..=0x9E).contains(&tag) {
            bail!("Expected OCTET STRING tag (0x04), got: 0x{:02X}", tag);
        }
        Ok(contents.to_vec())
    }

    fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_octet_string()?;
        String::from_utf8(bytes).context("Invalid UTF-8 string")
    }
}

fn decode_integer(bytes: &[u8]) -> Result<i32> {
    if bytes.is_empty() || bytes.len() > 4 {
        bail!("Integer must be 1..=4 bytes, got: {}", bytes.len());
    }
    let negative = bytes[0] & 0x80 != 0;
    let mut value: i32 = if negative { -1 } else { 0 };
    for &b in bytes {
        value = (value << 8) | b as i32;
    }
    Ok(value)
}

// BER encoding utilities
#[derive(Default)]
pub struct BerWriter {
    buffer: Vec<u8>,
}

fn encode_length(length: usize) -> Vec<u8> {
    if length < 128 {
        return vec![length as u8];
    }
    let bytes = (length as u64).to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    let mut out = Vec::with_capacity(1 + 8 - skip);
    out.push(0x80 | (8 - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
    out
}

impl BerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn write_length(&mut self, length: usize) {
        self.buffer.extend(encode_length(length));
    }

    pub fn write_integer(&mut self, value: i32) {
        let bytes = value.to_be_bytes();
        // Drop leading bytes that only repeat the sign.
        let mut start = 0;
        while start < 3 {
            let (b, next) = (bytes[start], bytes[start + 1]);
            if (b == 0x00 && next & 0x80 == 0) || (b == 0xFF && next & 0x80 != 0) {
                start += 1;
            } else {
                break;
            }
        }
        self.write_primitive(0x02, &bytes[start..]);
    }

    /// Write a primitive TLV with an arbitrary tag.
    pub fn write_primitive(&mut self, tag: u8, data: &[u8]) {
        self.write_tag(tag);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_primitive(0x04, data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_primitive(0x01, &[if value { 0xFF } else { 0x00 }]);
    }

    pub fn write_enumerated(&mut self, value: u8) {
        self.write_primitive(0x0A, &[value]);
    }

    /// Open a constructed element. Pass the returned position to [`BerWriter::end`].
    pub fn start(&mut self, tag: u8) -> usize {
        self.write_tag(tag);
        let pos = self.buffer.len();
        self.buffer.push(0);
        pos
    }

    /// Back-patch the length of the element opened at `pos`.
    pub fn end(&mut self, pos: usize) {
        let content_len = self.buffer.len() - (pos + 1);
        self.buffer.splice(pos..pos + 1, encode_length(content_len));
    }

    pub fn start_sequence(&mut self) -> usize {
        self.start(0x30)
    }

    pub fn end_sequence(&mut self, pos: usize) {
        self.end(pos)
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

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
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;

/// Context [0] IMPLICIT SEQUENCE OF control
const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;

/// Response tag for a request tag. None for requests that get no response.
pub fn response_tag_for_request(request_tag: u8) -> Option<u8> {
    match request_tag {
        LDAP_TAG_BIND_REQUEST => Some(LDAP_TAG_BIND_RESPONSE),
        LDAP_TAG_SEARCH_REQUEST => Some(LDAP_TAG_SEARCH_RESULT_DONE),
        LDAP_TAG_MODIFY_REQUEST => Some(LDAP_TAG_MODIFY_RESPONSE),
        LDAP_TAG_ADD_REQUEST => Some(LDAP_TAG_ADD_RESPONSE),
        LDAP_TAG_DEL_REQUEST => Some(LDAP_TAG_DEL_RESPONSE),
        LDAP_TAG_MODIFY_DN_REQUEST => Some(LDAP_TAG_MODIFY_DN_RESPONSE),
        LDAP_TAG_COMPARE_REQUEST => Some(LDAP_TAG_COMPARE_RESPONSE),
        LDAP_TAG_EXTENDED_REQUEST => Some(LDAP_TAG_EXTENDED_RESPONSE),
        _ => None,
    }
}

/// Parse only the LDAP message header (SEQUENCE, messageID, protocolOp tag).
/// Returns (message_id, request_tag) for building error responses when full parse fails.
pub fn parse_ldap_message_header(data: &[u8]) -> Result<(i32, u8)> {
    let mut reader = BerReader::new(data);
    if reader.read_tag()? != 0x30 {
        bail!("LDAPMessage must be a SEQUENCE");
    }
    reader.read_length()?;
    let message_id = reader.read_integer()?;
    let tag = reader.read_tag()?;
    Ok((message_id, tag))
}

pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage> {
    let mut outer = BerReader::new(data);

    // LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
    let mut reader = outer.read_sequence()?;
    let message_id = reader.read_integer()?;
    if message_id < 0 {
        bail!("Negative message ID: {}", message_id);
    }

    let (tag, contents) = reader.read_element()?;
    let mut op = BerReader::new(contents);
    let protocol_op = match tag {
        LDAP_TAG_BIND_REQUEST => ProtocolOp::BindRequest(parse_bind_request(&mut op)?),
        LDAP_TAG_UNBIND_REQUEST => ProtocolOp::UnbindRequest,
        LDAP_TAG_SEARCH_REQUEST => ProtocolOp::SearchRequest(parse_search_request(&mut op)?),
        LDAP_TAG_MODIFY_REQUEST => ProtocolOp::ModifyRequest(parse_modify_request(&mut op)?),
        LDAP_TAG_ADD_REQUEST => ProtocolOp::AddRequest(parse_add_request(&mut op)?),
        LDAP_TAG_DEL_REQUEST => ProtocolOp::DelRequest(DelRequest {
            entry: String::from_utf8(contents.to_vec()).context("Invalid UTF-8 DN")?,
        }),
        LDAP_TAG_MODIFY_DN_REQUEST => ProtocolOp::ModifyDNRequest(parse_modify_dn_request(&mut op)?),
        LDAP_TAG_COMPARE_REQUEST => ProtocolOp::CompareRequest(parse_compare_request(&mut op)?),
        LDAP_TAG_ABANDON_REQUEST => ProtocolOp::AbandonRequest(decode_integer(contents)?),
        LDAP_TAG_EXTENDED_REQUEST => ProtocolOp::ExtendedRequest(parse_extended_request(&mut op)?),
        _ => bail!("Unsupported LDAP operation tag: 0x{:02X}", tag),
    };

    let controls = if reader.peek_tag() == Some(LDAP_CONTEXT_CONTROLS) {
        let mut ctrls = reader.read_constructed(LDAP_CONTEXT_CONTROLS)?;
        Some(parse_controls(&mut ctrls)?)
    } else {
        None
    };

    Ok(LdapMessage {
        message_id,
        protocol_op,
        controls,
    })
}

/// Control ::= SEQUENCE { controlType, criticality BOOLEAN DEFAULT FALSE, controlValue OCTET STRING OPTIONAL }
fn parse_controls(reader: &mut BerReader) -> Result<Vec<Control>> {
    let mut controls = Vec::new();
    while !reader.is_empty() {
        let mut ctrl = reader.read_sequence()?;
        let ctype = ctrl.read_string()?;
        let critical = if ctrl.peek_tag() == Some(0x01) {
            ctrl.read_boolean()?
        } else {
            false
        };
        let value = if ctrl.is_empty() {
            None
        } else {
            Some(ctrl.read_octet_string()?)
        };
        controls.push(Control {
            ctype,
            critical,
            value,
        });
    }
    Ok(controls)
}

fn parse_bind_request(reader: &mut BerReader) -> Result<BindRequest> {
    let version = reader.read_integer()?;
    let name = reader.read_string()?;

    // simple is [0] IMPLICIT OCTET STRING (0x80) but some clients send other
    // primitive tags; anything that is not SASL [3] is read as simple.
    let (auth_tag, auth) = reader.read_element()?;
    let authentication = if auth_tag == 0xA3 {
        let mut sasl = BerReader::new(auth);
        let mechanism = sasl.read_string()?;
        let credentials = if sasl.is_empty() {
            Vec::new()
        } else {
            sasl.read_octet_string()?
        };
        BindAuthentication::Sasl {
            mechanism,
            credentials,
        }
    } else {
        BindAuthentication::Simple(auth.to_vec())
    };

    Ok(BindRequest {
        version,
        name,
        authentication,
    })
}

fn parse_search_request(reader: &mut BerReader) -> Result<SearchRequest> {
    let base_object = reader.read_string()?;
    let scope = SearchScope::try_from(reader.read_enumerated()?)?;
    let deref_aliases = reader.read_enumerated()?;
    let size_limit = reader.read_integer()?;
    let time_limit = reader.read_integer()?;
    let types_only = reader.read_boolean()?;
    let filter = parse_filter(reader, 0)?;

    let mut attrs = reader.read_sequence()?;
    let mut attributes = Vec::new();
    while !attrs.is_empty() {
        attributes.push(attrs.read_string()?);
    }

    Ok(SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    })
}

fn parse_filter(reader: &mut BerReader, depth: usize) -> Result<Filter> {
    if depth > MAX_FILTER_DEPTH {
        bail!("Filter nested too deeply");
    }
    let (tag, contents) = reader.read_element()?;
    let mut inner = BerReader::new(contents);
    let filter = match tag {
        0xA0 | 0xA1 => {
            let mut items = Vec::new();
            while !inner.is_empty() {
                items.push(parse_filter(&mut inner, depth + 1)?);
            }
            if tag == 0xA0 {
                Filter::And(items)
            } else {
                Filter::Or(items)
            }
        }
        0xA2 => Filter::Not(Box::new(parse_filter(&mut inner, depth + 1)?)),
        0xA3 | 0xA5 | 0xA6 | 0xA8 => {
            let attr = inner.read_string()?;
            let value = inner.read_octet_string()?;
            match tag {
                0xA3 => Filter::EqualityMatch { attr, value },
                0xA5 => Filter::GreaterOrEqual { attr, value },
                0xA6 => Filter::LessOrEqual { attr, value },
                _ => Filter::ApproxMatch { attr, value },
            }
        }
        0xA4 => {
            let attr = inner.read_string()?;
            let mut subs = inner.read_sequence()?;
            let (mut initial, mut any, mut final_) = (None, Vec::new(), None);
            while !subs.is_empty() {
                let (sub_tag, value) = subs.read_element()?;
                match sub_tag {
                    0x80 => initial = Some(value.to_vec()),
                    0x81 => any.push(value.to_vec()),
                    0x82 => final_ = Some(value.to_vec()),
                    _ => bail!("Invalid substring choice: 0x{:02X}", sub_tag),
                }
            }
            Filter::Substrings { attr, initial, any, final_ }
        }
        0x87 => Filter::Present(String::from_utf8(contents.to_vec()).context("Invalid UTF-8 attribute")?),
        0xA9 => {
            let (mut matching_rule, mut attr, mut value, mut dn_attributes) = (None, None, Vec::new(), false);
            while !inner.is_empty() {
                let (field, bytes) = inner.read_element()?;
                match field {
                    0x81 => matching_rule = Some(String::from_utf8_lossy(bytes).into_owned()),
                    0x82 => attr = Some(String::from_utf8_lossy(bytes).into_owned()),
                    0x83 => value = bytes.to_vec(),
                    0x84 => dn_attributes = bytes.first().is_some_and(|b| *b != 0),
                    _ => bail!("Invalid extensible match field: 0x{:02X}", field),
                }
            }
            Filter::ExtensibleMatch { matching_rule, attr, value, dn_attributes }
        }
        _ => bail!("Unsupported filter tag: 0x{:02X}", tag),
    };
    Ok(filter)
}

fn parse_modify_request(reader: &mut BerReader) -> Result<ModifyRequest> {
    let object = reader.read_string()?;

    let mut list = reader.read_sequence()?;
    let mut changes = Vec::new();
    while !list.is_empty() {
        let mut change = list.read_sequence()?;
        let operation = match change.read_enumerated()? {
            0 => ModifyOperation::Add,
            1 => ModifyOperation::Delete,
            2 => ModifyOperation::Replace,
            other => bail!("Invalid modify operation: {}", other),
        };
        let modification = parse_attribute(&mut change)?;
        changes.push(ModifyChange {
            operation,
            modification,
        });
    }

    Ok(ModifyRequest { object, changes })
}

fn parse_add_request(reader: &mut BerReader) -> Result<AddRequest> {
    let entry = reader.read_string()?;

    let mut list = reader.read_sequence()?;
    let mut attributes = Vec::new();
    while !list.is_empty() {
        attributes.push(parse_attribute(&mut list)?);
    }

    Ok(AddRequest { entry, attributes })
}

/// ModifyDNRequest ::= [APPLICATION 12] SEQUENCE { entry, newrdn, deleteoldrdn, newSuperior [0] OPTIONAL }
fn parse_modify_dn_request(reader: &mut BerReader) -> Result<ModifyDNRequest> {
    let entry = reader.read_string()?;
    let newrdn = reader.read_string()?;
    let delete_old_rdn = reader.read_boolean()?;
    let new_superior = if reader.peek_tag() == Some(0x80) {
        Some(reader.read_string()?)
    } else {
        None
    };
    Ok(ModifyDNRequest {
        entry,
        newrdn,
        delete_old_rdn,
        new_superior,
    })
}

/// CompareRequest ::= [APPLICATION 14] SEQUENCE { entry, ava AttributeValueAssertion }
fn parse_compare_request(reader: &mut BerReader) -> Result<CompareRequest> {
    let entry = reader.read_string()?;
    let mut ava = reader.read_sequence()?;
    let attr = ava.read_string()?;
    let assertion_value = ava.read_octet_string()?;
    Ok(CompareRequest {
        entry,
        attr,
        assertion_value,
    })
}

/// ExtendedRequest ::= [APPLICATION 23] SEQUENCE { requestName [0], requestValue [1] OPTIONAL }
fn parse_extended_request(reader: &mut BerReader) -> Result<ExtendedRequest> {
    let request_name = reader.read_string()?;
    let request_value = if reader.is_empty() {
        None
    } else {
        Some(reader.read_octet_string()?)
    };
    Ok(ExtendedRequest {
        request_name,
        request_value,
    })
}

fn parse_attribute(reader: &mut BerReader) -> Result<Attribute> {
    let mut attr = reader.read_sequence()?;
    let attr_type = attr.read_string()?;
    let mut vals = attr.read_set_or_sequence()?;
    let mut attr_values = Vec::new();
    while !vals.is_empty() {
        attr_values.push(vals.read_octet_string()?);
    }
    Ok(Attribute {
        attr_type,
        attr_values,
    })
}

pub fn encode_ldap_message(message: &LdapMessage) -> Result<Vec<u8>> {
    let mut writer = BerWriter::new();
    let seq_start = writer.start_sequence();
    writer.write_integer(message.message_id);

    match &message.protocol_op {
        ProtocolOp::BindResponse(r) => encode_result(&mut writer, LDAP_TAG_BIND_RESPONSE, r),
        ProtocolOp::SearchResultEntry(entry) => encode_search_result_entry(&mut writer, entry),
        ProtocolOp::SearchResultDone(r) => encode_result(&mut writer, LDAP_TAG_SEARCH_RESULT_DONE, r),
        ProtocolOp::ModifyResponse(r) => encode_result(&mut writer, LDAP_TAG_MODIFY_RESPONSE, r),
        ProtocolOp::AddResponse(r) => encode_result(&mut writer, LDAP_TAG_ADD_RESPONSE, r),
        ProtocolOp::DelResponse(r) => encode_result(&mut writer, LDAP_TAG_DEL_RESPONSE, r),
        ProtocolOp::ModifyDNResponse(r) => encode_result(&mut writer, LDAP_TAG_MODIFY_DN_RESPONSE, r),
        ProtocolOp::CompareResponse(r) => encode_result(&mut writer, LDAP_TAG_COMPARE_RESPONSE, r),
        ProtocolOp::ExtendedResponse(resp) => encode_extended_response(&mut writer, resp),
        other => bail!("Cannot encode request operation: {}", other.name()),
    }

    writer.end_sequence(seq_start);
    Ok(writer.into_vec())
}

/// Encode a complete LDAPMessage carrying only an LDAPResult under `response_tag`.
pub fn encode_result_message(message_id: i32, response_tag: u8, result: &LdapResult) -> Vec<u8> {
    let mut writer = BerWriter::new();
    let seq_start = writer.start_sequence();
    writer.write_integer(message_id);
    encode_result(&mut writer, response_tag, result);
    writer.end_sequence(seq_start);
    writer.into_vec()
}

fn write_result_components(writer: &mut BerWriter, result: &LdapResult) {
    writer.write_enumerated(result.code.code());
    writer.write_string(&result.matched_dn);
    writer.write_string(&result.diagnostic_message);
}

fn encode_result(writer: &mut BerWriter, tag: u8, result: &LdapResult) {
    let pos = writer.start(tag);
    write_result_components(writer, result);
    writer.end(pos);
}

fn encode_search_result_entry(writer: &mut BerWriter, entry: &SearchResultEntry) {
    let pos = writer.start(LDAP_TAG_SEARCH_RESULT_ENTRY);
    writer.write_string(&entry.object_name);
    let attrs_start = writer.start_sequence();
    for attr in &entry.attributes {
        encode_attribute(writer, attr);
    }
    writer.end_sequence(attrs_start);
    writer.end(pos);
}

fn encode_extended_response(writer: &mut BerWriter, resp: &ExtendedResponse) {
    let pos = writer.start(LDAP_TAG_EXTENDED_RESPONSE);
    write_result_components(writer, &resp.result);
    if let Some(ref name) = resp.response_name {
        writer.write_primitive(0x8A, name.as_bytes());
    }
    if let Some(ref value) = resp.response_value {
        writer.write_primitive(0x8B, value);
    }
    writer.end(pos);
}

fn encode_attribute(writer: &mut BerWriter, attr: &Attribute) {
    let seq_start = writer.start_sequence();
    writer.write_string(&attr.attr_type);
    let vals_start = writer.start(0x31);
    for value in &attr.attr_values {
        writer.write_octet_string(value);
    }
    writer.end(vals_start);
    writer.end_sequence(seq_start);
}
