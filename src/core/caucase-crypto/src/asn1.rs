//! DER values of the extended key usage and certificate policies extensions.
//!
//! Encoding and decoding go through the ASN.1 layer of `x509-parser`. Object
//! identifiers stay [`Oid`]s backed by their encoded bytes, so arcs wider
//! than 64 bits (UUID-based `2.25.*` arcs) compare and prefix-match exactly.

use std::borrow::Cow;

use x509_parser::der_parser::asn1_rs::{
    Any, Error as Asn1Error, FromDer, SerializeError, Sequence, Tag, ToDer,
};

pub use x509_parser::der_parser::asn1_rs::Oid;

use crate::error::CryptoError;

/// Parses a dotted object identifier with arcs of up to 64 bits.
pub fn parse_oid(dotted: &str) -> Result<Oid<'static>, CryptoError> {
    dotted
        .parse::<Oid>()
        .map(|oid| oid.to_owned())
        .map_err(|_| CryptoError::InvalidInput(format!("bad oid {dotted}")))
}

/// Elements of a DER SEQUENCE, which must span all of `value`.
pub fn sequence_elements(value: &[u8]) -> Result<Vec<Any<'_>>, CryptoError> {
    let (rest, elements) = <Vec<Any> as FromDer<'_, Asn1Error>>::from_der(value)
        .map_err(|e| CryptoError::InvalidInput(format!("bad sequence: {e}")))?;
    if !rest.is_empty() {
        return Err(CryptoError::InvalidInput("trailing bytes after sequence".to_string()));
    }
    Ok(elements)
}

/// The policyIdentifier of one PolicyInformation. Qualifiers are ignored.
pub fn policy_identifier<'a>(policy: &Any<'a>) -> Result<Oid<'a>, CryptoError> {
    if policy.tag() != Tag::Sequence {
        return Err(CryptoError::InvalidInput("policy is not a sequence".to_string()));
    }
    let identifier = first_element(policy.data)?;
    if identifier.tag() != Tag::Oid {
        return Err(CryptoError::InvalidInput("policy identifier is not an oid".to_string()));
    }
    Ok(Oid::new(Cow::Borrowed(identifier.data)))
}

/// A PolicyInformation carrying `oid` and no qualifiers.
pub fn policy_information(oid: &Oid<'_>) -> Result<Vec<u8>, CryptoError> {
    encode_sequence(std::slice::from_ref(oid))
}

/// DER SEQUENCE of `elements`, each encoded in turn.
pub fn encode_sequence<T: ToDer>(elements: &[T]) -> Result<Vec<u8>, CryptoError> {
    let mut content = Vec::new();
    for element in elements {
        content.extend(element.to_der_vec().map_err(encode_failed)?);
    }
    Sequence::new(Cow::Owned(content))
        .to_der_vec()
        .map_err(encode_failed)
}

/// The first DER value in `bytes`; anything after it is ignored.
pub fn first_element(bytes: &[u8]) -> Result<Any<'_>, CryptoError> {
    <Any as FromDer<'_, Asn1Error>>::from_der(bytes)
        .map(|(_, any)| any)
        .map_err(|e| CryptoError::InvalidInput(format!("bad der value: {e}")))
}

fn encode_failed(e: SerializeError) -> CryptoError {
    CryptoError::InvalidInput(format!("der encoding failed: {e}"))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_policies_split_and_identified() {
        let first = policy_information(&parse_oid("1.2.3.4").unwrap()).unwrap();
        let second = policy_information(&parse_oid("2.25.7").unwrap()).unwrap();
        assert_eq!(first, [0x30, 0x05, 0x06, 0x03, 0x2a, 0x03, 0x04]);

        let mut content = first.clone();
        content.extend(&second);
        let value = Sequence::new(Cow::Owned(content)).to_der_vec().unwrap();

        let elements = sequence_elements(&value).unwrap();
        let ids: Vec<String> = elements
            .iter()
            .map(|policy| policy_identifier(policy).unwrap().to_id_string())
            .collect();
        assert_eq!(ids, vec!["1.2.3.4", "2.25.7"]);
        assert_eq!(elements[0].to_der_vec().unwrap(), first);
    }

    #[test]
    fn test_wide_arc_kept_as_encoded() {
        // 2.25.340282366920938463463374607431768211455, one arc of 128 set bits.
        let mut encoded = vec![0x69, 0x83];
        encoded.extend([0xff; 17]);
        encoded.push(0x7f);
        let wide = Oid::new(Cow::Owned(encoded.clone()));
        let child = {
            let mut bytes = encoded;
            bytes.push(0x01);
            Oid::new(Cow::Owned(bytes))
        };

        let info = policy_information(&child).unwrap();
        let any = first_element(&info).unwrap();
        let id = policy_identifier(&any).unwrap();
        assert_eq!(id, child);
        assert!(id.starts_with(&wide));
        assert!(id.iter().is_none());
    }

    #[test]
    fn test_malformed_values_rejected() {
        assert!(sequence_elements(&[0x04, 0x00]).is_err());
        assert!(sequence_elements(&[0x30, 0x05, 0x06]).is_err());
        assert!(sequence_elements(&[0x30, 0x00, 0x00]).is_err());

        let not_an_oid = [0x30, 0x03, 0x02, 0x01, 0x01];
        let any = first_element(&not_an_oid).unwrap();
        assert!(policy_identifier(&any).is_err());
        assert!(parse_oid("1.two.3").is_err());
    }
}
