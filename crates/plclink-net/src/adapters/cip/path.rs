//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Symbolic tag path parsing and CIP segment encoding."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use bytes::{BufMut, BytesMut};
use plclink_core::LinkError;

const SYMBOLIC_SEGMENT: u8 = 0x91;
const ELEMENT_8: u8 = 0x28;
const ELEMENT_16: u8 = 0x29;
const ELEMENT_32: u8 = 0x2A;

/// One step of a symbolic request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Symbol(String),
    Element(u32),
}

/// Parsed controller address such as `Program:Main.Recipe[2].Steps[1,4]` or
/// `Flags[0].5`. A trailing numeric member selects one bit of an integer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagPath {
    pub segments: Vec<PathSegment>,
    pub bit: Option<u8>,
}

impl TagPath {
    pub fn parse(address: &str) -> Result<Self, LinkError> {
        let invalid = |detail: &str| LinkError::InvalidAddressFormat(format!("{address}: {detail}"));
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty address"));
        }

        let parts: Vec<&str> = trimmed.split('.').collect();
        let mut segments = Vec::new();
        let mut bit = None;
        for (position, part) in parts.iter().enumerate() {
            if position > 0 && !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) {
                if position != parts.len() - 1 {
                    return Err(invalid("bit selector must be the last member"));
                }
                let index: u8 = part.parse().map_err(|_| invalid("bit index too large"))?;
                if index > 31 {
                    return Err(invalid("bit index must be below 32"));
                }
                bit = Some(index);
                continue;
            }

            let (name, mut rest) = match part.find('[') {
                Some(open) => (&part[..open], &part[open..]),
                None => (*part, ""),
            };
            if name.is_empty() {
                return Err(invalid("empty member name"));
            }
            if !name.is_ascii() || name.len() > u8::MAX as usize {
                return Err(invalid("member names must be ASCII and at most 255 bytes"));
            }
            segments.push(PathSegment::Symbol(name.to_owned()));

            // One or more bracket groups, e.g. `[1,2]` or `[0][3]`.
            while !rest.is_empty() {
                let Some(group) = rest.strip_prefix('[') else {
                    return Err(invalid("unexpected characters after element index"));
                };
                let Some(close) = group.find(']') else {
                    return Err(invalid("unterminated element index"));
                };
                for index in group[..close].split(',') {
                    let value: u32 = index
                        .trim()
                        .parse()
                        .map_err(|_| invalid("element indices must be unsigned integers"))?;
                    segments.push(PathSegment::Element(value));
                }
                rest = &group[close + 1..];
            }
        }
        Ok(Self { segments, bit })
    }

    /// Path of the integer word holding the selected bit, or the path itself.
    pub fn word(&self) -> TagPath {
        TagPath {
            segments: self.segments.clone(),
            bit: None,
        }
    }

    /// CIP request path bytes, padded to a whole number of 16-bit words.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for segment in &self.segments {
            match segment {
                PathSegment::Symbol(name) => {
                    buf.put_u8(SYMBOLIC_SEGMENT);
                    buf.put_u8(name.len() as u8);
                    buf.put_slice(name.as_bytes());
                    if name.len() % 2 == 1 {
                        buf.put_u8(0);
                    }
                }
                PathSegment::Element(index) => {
                    if let Ok(small) = u8::try_from(*index) {
                        buf.put_u8(ELEMENT_8);
                        buf.put_u8(small);
                    } else if let Ok(medium) = u16::try_from(*index) {
                        buf.put_u8(ELEMENT_16);
                        buf.put_u8(0);
                        buf.put_u16_le(medium);
                    } else {
                        buf.put_u8(ELEMENT_32);
                        buf.put_u8(0);
                        buf.put_u32_le(*index);
                    }
                }
            }
        }
        buf.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_members_indices_and_bits() {
        let path = TagPath::parse("_200_GLB.BoolData[0].0").unwrap();
        assert_eq!(
            path.segments,
            vec![
                PathSegment::Symbol("_200_GLB".into()),
                PathSegment::Symbol("BoolData".into()),
                PathSegment::Element(0),
            ]
        );
        assert_eq!(path.bit, Some(0));

        let multi = TagPath::parse("Program:Main.Grid[1,2]").unwrap();
        assert_eq!(multi.segments.len(), 4);
        assert_eq!(multi.segments[0], PathSegment::Symbol("Program:Main".into()));
        assert_eq!(multi.segments[3], PathSegment::Element(2));
        assert_eq!(multi.bit, None);

        let element = TagPath::parse("_200_GLB.StringData[0][2]").unwrap();
        assert_eq!(
            &element.segments[2..],
            &[PathSegment::Element(0), PathSegment::Element(2)]
        );
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in ["", "Tag[", "Tag[x]", "Tag[1]x", ".Tag", "Tag.40", "Tag.3.Member", "Täg"] {
            assert!(
                matches!(TagPath::parse(bad), Err(LinkError::InvalidAddressFormat(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn encodes_symbolic_and_element_segments() {
        let path = TagPath::parse("Abc.D[5]").unwrap();
        assert_eq!(
            path.encode(),
            vec![0x91, 3, b'A', b'b', b'c', 0, 0x91, 1, b'D', 0, 0x28, 5]
        );

        let wide = TagPath::parse("T[300]").unwrap();
        assert_eq!(wide.encode(), vec![0x91, 1, b'T', 0, 0x29, 0, 0x2C, 0x01]);

        let huge = TagPath::parse("T[70000]").unwrap();
        assert_eq!(
            huge.encode(),
            vec![0x91, 1, b'T', 0, 0x2A, 0, 0x70, 0x11, 0x01, 0x00]
        );
    }
}
