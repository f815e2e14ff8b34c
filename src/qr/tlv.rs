//! Tag-length-value scanning and emission.
//!
//! Tags are two digits, lengths two decimal digits counting characters.

use super::QrError;

pub const MAX_VALUE_LEN: usize = 99;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvField {
    pub tag: String,
    pub value: String,
}

impl TlvField {
    pub fn new(tag: &str, value: impl Into<String>) -> Self {
        Self {
            tag: tag.to_string(),
            value: value.into(),
        }
    }

    pub fn encode(&self) -> Result<String, QrError> {
        emit(&self.tag, &self.value)
    }
}

pub fn emit(tag: &str, value: &str) -> Result<String, QrError> {
    if tag.len() != 2 || !tag.bytes().all(|b| b.is_ascii_digit()) {
        return Err(QrError::InvalidTag(tag.to_string()));
    }
    let len = value.chars().count();
    if len > MAX_VALUE_LEN {
        return Err(QrError::ValueTooLong {
            tag: tag.to_string(),
            len,
        });
    }
    Ok(format!("{}{:02}{}", tag, len, value))
}

/// Split `input` into its top-level fields, in order.
pub fn parse(input: &str) -> Result<Vec<TlvField>, QrError> {
    let chars: Vec<char> = input.chars().collect();
    let mut fields = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        if pos + 4 > chars.len() {
            return Err(QrError::Truncated { offset: pos });
        }
        let tag: String = chars[pos..pos + 2].iter().collect();
        if !tag.chars().all(|c| c.is_ascii_digit()) {
            return Err(QrError::InvalidTag(tag));
        }
        let len_text: String = chars[pos + 2..pos + 4].iter().collect();
        let len: usize = len_text
            .parse()
            .map_err(|_| QrError::InvalidLength {
                tag: tag.clone(),
                raw: len_text.clone(),
            })?;
        let start = pos + 4;
        let end = start + len;
        if end > chars.len() {
            return Err(QrError::Truncated { offset: pos });
        }
        fields.push(TlvField {
            tag,
            value: chars[start..end].iter().collect(),
        });
        pos = end;
    }

    Ok(fields)
}

pub fn find<'a>(fields: &'a [TlvField], tag: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|f| f.tag == tag)
        .map(|f| f.value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_two_digit_length() {
        assert_eq!(emit("00", "01").unwrap(), "000201");
        assert_eq!(emit("59", "SHOP").unwrap(), "5904SHOP");
        assert!(emit("5", "x").is_err());
        assert!(emit("59", &"x".repeat(100)).is_err());
    }

    #[test]
    fn parses_sequence_and_nested_values() {
        let fields = parse("000201010212261600041234010412345303104").unwrap();
        assert_eq!(fields.len(), 4);
        assert_eq!(find(&fields, "01"), Some("12"));
        assert_eq!(find(&fields, "53"), Some("104"));

        let nested = parse(find(&fields, "26").unwrap()).unwrap();
        assert_eq!(find(&nested, "00"), Some("1234"));
        assert_eq!(find(&nested, "01"), Some("1234"));
    }

    #[test]
    fn rejects_truncated_input() {
        assert!(matches!(
            parse("0002010"),
            Err(QrError::Truncated { .. })
        ));
        assert!(matches!(parse("5910SHOP"), Err(QrError::Truncated { .. })));
        assert!(matches!(parse("59xxSHOP"), Err(QrError::InvalidLength { .. })));
    }

    #[test]
    fn lengths_count_characters() {
        let encoded = emit("59", "ရန်ကုန်").unwrap();
        let fields = parse(&encoded).unwrap();
        assert_eq!(fields[0].value, "ရန်ကုန်");
    }
}
