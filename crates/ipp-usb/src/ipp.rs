//! Minimal IPP (RFC 8010) binary message codec.
//!
//! Response sanitization and the Get-Printer-Attributes probe both need
//! to read and write the same tag/value wire format, so this module is
//! the shared minimal codec both call into. Not a full IPP implementation
//! (no collections, no 1setOf grouping beyond repeated name-less values),
//! just enough structure to decode leniently, re-encode strictly, and
//! pull a handful of named attributes back out.

const TAG_OPERATION_ATTRIBUTES: u8 = 0x01;
const TAG_JOB_ATTRIBUTES: u8 = 0x02;
const TAG_END_OF_ATTRIBUTES: u8 = 0x03;
const TAG_PRINTER_ATTRIBUTES: u8 = 0x04;
const TAG_UNSUPPORTED_ATTRIBUTES: u8 = 0x05;

fn is_delimiter_tag(tag: u8) -> bool {
    (0x00..=0x0f).contains(&tag)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IppValue {
    pub tag: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IppAttribute {
    pub name: String,
    pub values: Vec<IppValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IppGroup {
    pub tag: u8,
    pub attributes: Vec<IppAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IppMessage {
    pub version: (u8, u8),
    pub status_or_operation: u16,
    pub request_id: u32,
    pub groups: Vec<IppGroup>,
}

impl IppMessage {
    /// First value of the named attribute in any group, decoded as UTF-8
    /// text/keyword (used by the Get-Printer-Attributes probe).
    pub fn attribute_text(&self, name: &str) -> Option<String> {
        self.groups
            .iter()
            .flat_map(|g| &g.attributes)
            .find(|a| a.name == name)
            .and_then(|a| a.values.first())
            .map(|v| String::from_utf8_lossy(&v.data).into_owned())
    }

    /// All text values of the named attribute across every group, in
    /// declaration order (used for 1setOf attributes like media-supported).
    pub fn attribute_text_values(&self, name: &str) -> Vec<String> {
        self.groups
            .iter()
            .flat_map(|g| &g.attributes)
            .filter(|a| a.name == name)
            .flat_map(|a| &a.values)
            .map(|v| String::from_utf8_lossy(&v.data).into_owned())
            .collect()
    }
}

/// Decode best-effort: stop and return what was parsed so far instead of
/// failing outright on the first malformed attribute. Returns `None` only
/// if even the fixed 8-byte header cannot be read.
pub fn decode_lenient(data: &[u8]) -> Option<IppMessage> {
    if data.len() < 8 {
        return None;
    }
    let version = (data[0], data[1]);
    let status_or_operation = u16::from_be_bytes([data[2], data[3]]);
    let request_id = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

    let mut pos = 8;
    let mut groups = Vec::new();
    let mut current: Option<IppGroup> = None;
    let mut last_attr_name: Option<String> = None;

    while pos < data.len() {
        let tag = data[pos];
        pos += 1;

        if is_delimiter_tag(tag) {
            if let Some(g) = current.take() {
                groups.push(g);
            }
            if tag == TAG_END_OF_ATTRIBUTES {
                break;
            }
            current = Some(IppGroup {
                tag,
                attributes: Vec::new(),
            });
            last_attr_name = None;
            continue;
        }

        let Some(group) = current.as_mut() else {
            break; // value tag before any group delimiter: malformed, stop here
        };

        let Some(name_len) = read_u16(data, &mut pos) else { break };
        let Some(name) = read_bytes(data, &mut pos, name_len as usize) else { break };
        let Some(value_len) = read_u16(data, &mut pos) else { break };
        let Some(value) = read_bytes(data, &mut pos, value_len as usize) else { break };

        if name.is_empty() {
            // Additional value for the previous attribute (1setOf).
            if let (Some(last_name), Some(attr)) = (
                &last_attr_name,
                group.attributes.iter_mut().find(|a| Some(&a.name) == last_attr_name.as_ref()),
            ) {
                let _ = last_name;
                attr.values.push(IppValue { tag, data: value });
                continue;
            }
        }

        let name_string = String::from_utf8_lossy(&name).into_owned();
        last_attr_name = Some(name_string.clone());
        group.attributes.push(IppAttribute {
            name: name_string,
            values: vec![IppValue { tag, data: value }],
        });
    }

    if let Some(g) = current {
        groups.push(g);
    }

    Some(IppMessage {
        version,
        status_or_operation,
        request_id,
        groups,
    })
}

/// Re-encode strictly: every attribute group terminated properly, every
/// length field consistent with the bytes that follow it. For a
/// well-formed `m`, `encode(decode(encode(m))) == encode(m)`.
pub fn encode_strict(message: &IppMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.push(message.version.0);
    out.push(message.version.1);
    out.extend_from_slice(&message.status_or_operation.to_be_bytes());
    out.extend_from_slice(&message.request_id.to_be_bytes());

    for group in &message.groups {
        out.push(group.tag);
        for attr in &group.attributes {
            for (i, value) in attr.values.iter().enumerate() {
                out.push(value.tag);
                let name = if i == 0 { attr.name.as_bytes() } else { &[] };
                out.extend_from_slice(&(name.len() as u16).to_be_bytes());
                out.extend_from_slice(name);
                out.extend_from_slice(&(value.data.len() as u16).to_be_bytes());
                out.extend_from_slice(&value.data);
            }
        }
    }
    out.push(TAG_END_OF_ATTRIBUTES);
    out
}

fn read_u16(data: &[u8], pos: &mut usize) -> Option<u16> {
    let end = *pos + 2;
    if end > data.len() {
        return None;
    }
    let v = u16::from_be_bytes([data[*pos], data[*pos + 1]]);
    *pos = end;
    Some(v)
}

fn read_bytes(data: &[u8], pos: &mut usize, len: usize) -> Option<Vec<u8>> {
    let end = *pos + len;
    if end > data.len() {
        return None;
    }
    let v = data[*pos..end].to_vec();
    *pos = end;
    Some(v)
}

/// Build the minimal Get-Printer-Attributes request body the probe step sends.
pub fn get_printer_attributes_request(request_id: u32) -> Vec<u8> {
    const OP_GET_PRINTER_ATTRIBUTES: u16 = 0x000B;
    const TAG_CHARSET: u8 = 0x47;
    const TAG_NATURAL_LANGUAGE: u8 = 0x48;
    const TAG_URI: u8 = 0x45;
    const TAG_KEYWORD: u8 = 0x44;

    let message = IppMessage {
        version: (2, 0),
        status_or_operation: OP_GET_PRINTER_ATTRIBUTES,
        request_id,
        groups: vec![IppGroup {
            tag: TAG_OPERATION_ATTRIBUTES,
            attributes: vec![
                IppAttribute {
                    name: "attributes-charset".into(),
                    values: vec![IppValue { tag: TAG_CHARSET, data: b"utf-8".to_vec() }],
                },
                IppAttribute {
                    name: "attributes-natural-language".into(),
                    values: vec![IppValue { tag: TAG_NATURAL_LANGUAGE, data: b"en".to_vec() }],
                },
                IppAttribute {
                    name: "printer-uri".into(),
                    values: vec![IppValue {
                        tag: TAG_URI,
                        data: b"http://localhost/ipp/print".to_vec(),
                    }],
                },
                IppAttribute {
                    name: "requested-attributes".into(),
                    values: vec![IppValue {
                        tag: TAG_KEYWORD,
                        data: b"all".to_vec(),
                    }],
                },
            ],
        }],
    };
    encode_strict(&message)
}

#[allow(dead_code)]
const fn _unused_group_tags() -> (u8, u8, u8) {
    (TAG_JOB_ATTRIBUTES, TAG_PRINTER_ATTRIBUTES, TAG_UNSUPPORTED_ATTRIBUTES)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> IppMessage {
        IppMessage {
            version: (2, 0),
            status_or_operation: 0x0000,
            request_id: 7,
            groups: vec![IppGroup {
                tag: TAG_OPERATION_ATTRIBUTES,
                attributes: vec![IppAttribute {
                    name: "printer-name".into(),
                    values: vec![IppValue {
                        tag: 0x42,
                        data: b"Office Printer".to_vec(),
                    }],
                }],
            }],
        }
    }

    #[test]
    fn encode_then_decode_preserves_attributes() {
        let message = sample_message();
        let encoded = encode_strict(&message);
        let decoded = decode_lenient(&encoded).unwrap();
        assert_eq!(decoded.attribute_text("printer-name").unwrap(), "Office Printer");
        assert_eq!(decoded.request_id, 7);
    }

    #[test]
    fn sanitization_is_idempotent_on_well_formed_message() {
        let message = sample_message();
        let first = encode_strict(&decode_lenient(&encode_strict(&message)).unwrap());
        let second = encode_strict(&decode_lenient(&first).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn decode_stops_gracefully_on_truncated_tail() {
        let mut encoded = encode_strict(&sample_message());
        encoded.truncate(encoded.len() - 3); // chop into the middle of a value
        let decoded = decode_lenient(&encoded).unwrap();
        assert_eq!(decoded.request_id, 7);
    }

    #[test]
    fn multi_valued_attribute_round_trips() {
        let message = IppMessage {
            version: (2, 0),
            status_or_operation: 0,
            request_id: 1,
            groups: vec![IppGroup {
                tag: TAG_PRINTER_ATTRIBUTES,
                attributes: vec![IppAttribute {
                    name: "media-supported".into(),
                    values: vec![
                        IppValue { tag: 0x44, data: b"iso_a4_210x297mm".to_vec() },
                        IppValue { tag: 0x44, data: b"na_letter_8.5x11in".to_vec() },
                    ],
                }],
            }],
        };
        let decoded = decode_lenient(&encode_strict(&message)).unwrap();
        assert_eq!(
            decoded.attribute_text_values("media-supported"),
            vec!["iso_a4_210x297mm".to_string(), "na_letter_8.5x11in".to_string()]
        );
    }
}
