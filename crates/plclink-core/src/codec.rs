//! ---
//! ems_section: "02-tag-layer"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Translation between logical tag values and wire operations."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Strings live on the controller as arrays of SINT character codes. A string
//! tag of `elements = N` is read as N element reads and written as up to N
//! element writes addressed `address[i]`. Decoding stops at the first NUL.
use plclink_common::{StringLayout, TagKind};

use crate::error::{LinkError, Result};
use crate::registry::TagDescriptor;
use crate::value::{widen_real, TagValue, WireRead, WireValue, WireWrite};

/// Wire reads needed to fetch `tag`, in element order.
pub fn plan_read(tag: &TagDescriptor) -> Vec<WireRead> {
    match tag.kind {
        TagKind::String => (0..tag.elements)
            .map(|index| WireRead {
                address: tag.element_address(index),
                wire_type: tag.wire_type(),
            })
            .collect(),
        _ => vec![WireRead {
            address: tag.address.clone(),
            wire_type: tag.wire_type(),
        }],
    }
}

/// Encode `value` into the wire writes for `tag`.
///
/// All validation happens here, so a returned plan never fails halfway
/// through for codec reasons.
pub fn encode(tag: &TagDescriptor, value: &TagValue) -> Result<Vec<WireWrite>> {
    let scalar = |value: WireValue| -> Result<Vec<WireWrite>> {
        Ok(vec![WireWrite {
            address: tag.address.clone(),
            value,
        }])
    };
    match (tag.kind, value) {
        (TagKind::Bool, TagValue::Bool(b)) => scalar(WireValue::Bool(*b)),
        (TagKind::Integer, TagValue::Integer(i)) => {
            let narrowed = i32::try_from(*i)
                .map_err(|_| LinkError::out_of_range(&tag.name, format!("{i} does not fit DINT")))?;
            scalar(WireValue::Dint(narrowed))
        }
        (TagKind::Real, TagValue::Real(r)) => {
            if !r.is_finite() {
                return Err(LinkError::out_of_range(&tag.name, format!("{r} is not finite")));
            }
            if r.abs() > f64::from(f32::MAX) {
                return Err(LinkError::out_of_range(&tag.name, format!("{r} does not fit REAL")));
            }
            let narrowed = *r as f32;
            if widen_real(narrowed) != *r {
                return Err(LinkError::out_of_range(
                    &tag.name,
                    format!("{r} cannot be stored exactly as REAL"),
                ));
            }
            scalar(WireValue::Real(narrowed))
        }
        (TagKind::String, TagValue::Text(text)) => encode_text(tag, text),
        (kind, other) => Err(LinkError::type_mismatch(
            &tag.name,
            format!("expected {kind}, got {}", other.kind()),
        )),
    }
}

fn encode_text(tag: &TagDescriptor, text: &str) -> Result<Vec<WireWrite>> {
    let length = text.chars().count();
    if length > tag.elements {
        return Err(LinkError::out_of_range(
            &tag.name,
            format!("{length} characters exceed {} elements", tag.elements),
        ));
    }

    let mut writes = Vec::with_capacity(tag.elements);
    for (index, ch) in text.chars().enumerate() {
        let code = u32::from(ch);
        if code == 0 {
            return Err(LinkError::out_of_range(
                &tag.name,
                format!("NUL at position {index} cannot be stored"),
            ));
        }
        let byte = u8::try_from(code).map_err(|_| {
            LinkError::out_of_range(&tag.name, format!("character {ch:?} is not a single byte"))
        })?;
        writes.push(WireWrite {
            address: tag.element_address(index),
            value: WireValue::Sint(byte as i8),
        });
    }

    if tag.layout == StringLayout::NulPadded {
        for index in length..tag.elements {
            writes.push(WireWrite {
                address: tag.element_address(index),
                value: WireValue::Sint(0),
            });
        }
    }
    Ok(writes)
}

/// Decode wire values read according to [`plan_read`].
pub fn decode(tag: &TagDescriptor, values: &[WireValue]) -> Result<TagValue> {
    let expected = match tag.kind {
        TagKind::String => tag.elements,
        _ => 1,
    };
    if values.len() != expected {
        return Err(LinkError::type_mismatch(
            &tag.name,
            format!("expected {expected} wire values, got {}", values.len()),
        ));
    }

    if tag.kind == TagKind::String {
        let mut text = String::with_capacity(values.len());
        for value in values {
            let byte = match value {
                WireValue::Sint(code) => *code as u8,
                other => {
                    return Err(LinkError::type_mismatch(
                        &tag.name,
                        format!("string element carried {}", other.wire_type()),
                    ))
                }
            };
            if byte == 0 {
                break;
            }
            text.push(char::from(byte));
        }
        return Ok(TagValue::Text(text));
    }

    match (tag.kind, values[0]) {
        (TagKind::Bool, WireValue::Bool(b)) => Ok(TagValue::Bool(b)),
        (TagKind::Integer, WireValue::Dint(v)) => Ok(TagValue::Integer(i64::from(v))),
        (TagKind::Integer, WireValue::Sint(v)) => Ok(TagValue::Integer(i64::from(v))),
        (TagKind::Real, WireValue::Real(v)) => Ok(TagValue::Real(widen_real(v))),
        (kind, other) => Err(LinkError::type_mismatch(
            &tag.name,
            format!("{kind} tag carried {}", other.wire_type()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::WireType;

    fn text_tag(elements: usize, layout: StringLayout) -> TagDescriptor {
        TagDescriptor::string("user", "Line.User", elements, layout)
    }

    fn codes(text: &str) -> Vec<WireValue> {
        text.bytes().map(|b| WireValue::Sint(b as i8)).collect()
    }

    #[test]
    fn scalars_round_trip() {
        let cases = [
            (TagDescriptor::scalar("b", "B", TagKind::Bool), TagValue::Bool(true)),
            (TagDescriptor::scalar("i", "I", TagKind::Integer), TagValue::Integer(-42)),
            (TagDescriptor::scalar("r", "R", TagKind::Real), TagValue::Real(12.5)),
        ];
        for (tag, value) in cases {
            let writes = encode(&tag, &value).unwrap();
            assert_eq!(writes.len(), 1);
            assert_eq!(writes[0].address, tag.address);
            let wire: Vec<_> = writes.iter().map(|w| w.value).collect();
            assert_eq!(decode(&tag, &wire).unwrap(), value);
        }
    }

    #[test]
    fn decimal_reals_come_back_unchanged() {
        let tag = TagDescriptor::scalar("q", "Q", TagKind::Real);
        for r in [0.1, 1.1, 3.14, 12.5, -250.75] {
            let writes = encode(&tag, &TagValue::Real(r)).unwrap();
            let wire: Vec<_> = writes.iter().map(|w| w.value).collect();
            assert_eq!(decode(&tag, &wire).unwrap(), TagValue::Real(r), "{r}");
        }
        assert_eq!(
            decode(&tag, &[WireValue::Real(0.1)]).unwrap(),
            TagValue::Real(0.1)
        );
    }

    #[test]
    fn reals_beyond_single_precision_are_refused() {
        let tag = TagDescriptor::scalar("q", "Q", TagKind::Real);
        assert!(matches!(
            encode(&tag, &TagValue::Real(0.123456789)),
            Err(LinkError::OutOfRange { .. })
        ));
        assert!(matches!(
            encode(&tag, &TagValue::Real(16_777_217.0)),
            Err(LinkError::OutOfRange { .. })
        ));
    }

    #[test]
    fn plan_read_decomposes_strings() {
        let plan = plan_read(&text_tag(3, StringLayout::NulPadded));
        let addresses: Vec<_> = plan.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addresses, ["Line.User[0]", "Line.User[1]", "Line.User[2]"]);
        assert!(plan.iter().all(|r| r.wire_type == WireType::Sint));

        let scalar = plan_read(&TagDescriptor::scalar("q", "Q", TagKind::Real));
        assert_eq!(
            scalar,
            vec![WireRead {
                address: "Q".into(),
                wire_type: WireType::Real
            }]
        );
    }

    #[test]
    fn nul_padded_strings_overwrite_stale_characters() {
        let tag = text_tag(5, StringLayout::NulPadded);
        let writes = encode(&tag, &TagValue::Text("ab".into())).unwrap();
        let values: Vec<_> = writes.iter().map(|w| w.value).collect();
        assert_eq!(
            values,
            [
                WireValue::Sint(b'a' as i8),
                WireValue::Sint(b'b' as i8),
                WireValue::Sint(0),
                WireValue::Sint(0),
                WireValue::Sint(0)
            ]
        );
        assert_eq!(writes[4].address, "Line.User[4]");
        assert_eq!(decode(&tag, &values).unwrap(), TagValue::Text("ab".into()));
    }

    #[test]
    fn exact_layout_writes_only_characters() {
        let tag = text_tag(5, StringLayout::Exact);
        let writes = encode(&tag, &TagValue::Text("ab".into())).unwrap();
        assert_eq!(writes.len(), 2);
    }

    #[test]
    fn long_controller_strings_truncate_at_element_count() {
        let tag = text_tag(3, StringLayout::NulPadded);
        // Only `elements` reads are planned, so the controller's "ABCDEF"
        // arrives as its first three characters.
        let wire = codes("ABC");
        assert_eq!(decode(&tag, &wire).unwrap(), TagValue::Text("ABC".into()));
    }

    #[test]
    fn rejects_values_that_cannot_be_stored() {
        let tag = text_tag(3, StringLayout::NulPadded);
        assert!(matches!(
            encode(&tag, &TagValue::Text("ABCD".into())),
            Err(LinkError::OutOfRange { .. })
        ));
        assert!(matches!(
            encode(&tag, &TagValue::Text("€".into())),
            Err(LinkError::OutOfRange { .. })
        ));

        let int = TagDescriptor::scalar("i", "I", TagKind::Integer);
        assert!(matches!(
            encode(&int, &TagValue::Integer(i64::from(i32::MAX) + 1)),
            Err(LinkError::OutOfRange { .. })
        ));

        let real = TagDescriptor::scalar("r", "R", TagKind::Real);
        assert!(matches!(
            encode(&real, &TagValue::Real(f64::NAN)),
            Err(LinkError::OutOfRange { .. })
        ));
        assert!(matches!(
            encode(&real, &TagValue::Real(1e300)),
            Err(LinkError::OutOfRange { .. })
        ));
    }

    #[test]
    fn kind_mismatches_are_not_coerced() {
        let tag = TagDescriptor::scalar("b", "B", TagKind::Bool);
        assert!(matches!(
            encode(&tag, &TagValue::Integer(1)),
            Err(LinkError::TypeMismatch { .. })
        ));
        assert!(matches!(
            decode(&tag, &[WireValue::Real(1.0)]),
            Err(LinkError::TypeMismatch { .. })
        ));
        assert!(matches!(
            decode(&text_tag(3, StringLayout::Exact), &codes("ab")),
            Err(LinkError::TypeMismatch { .. })
        ));
    }
}
