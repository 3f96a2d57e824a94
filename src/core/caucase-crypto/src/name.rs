//! Distinguished names carried between requests and issued certificates.

use rcgen::{DistinguishedName, DnType};
use x509_parser::x509::X509Name;

use crate::error::CryptoError;

/// OID of the commonName attribute.
pub const COMMON_NAME: &str = "2.5.4.3";

/// An ordered list of `(attribute OID, value)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectName {
    entries: Vec<(String, String)>,
}

impl SubjectName {
    /// A name holding only a common name.
    pub fn common_name(value: impl Into<String>) -> Self {
        Self {
            entries: vec![(COMMON_NAME.to_string(), value.into())],
        }
    }

    /// Reads a parsed X.509 name. Attributes that are not strings are rejected.
    pub fn from_x509(name: &X509Name<'_>) -> Result<Self, CryptoError> {
        let mut entries = Vec::new();
        for rdn in name.iter() {
            for attr in rdn.iter() {
                let oid = attr.attr_type().to_id_string();
                let value = attr
                    .as_str()
                    .map_err(|e| CryptoError::InvalidInput(format!("name attribute {oid}: {e}")))?;
                entries.push((oid, value.to_string()));
            }
        }
        Ok(Self { entries })
    }

    /// Attribute pairs in encoding order.
    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    /// First commonName value, if any.
    pub fn get_common_name(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|(oid, _)| oid == COMMON_NAME)
            .map(|(_, value)| value.as_str())
    }

    /// Converts to the rcgen form used when building certificates.
    pub fn to_distinguished_name(&self) -> Result<DistinguishedName, CryptoError> {
        let mut dn = DistinguishedName::new();
        for (oid, value) in &self.entries {
            let arcs = oid
                .split('.')
                .map(|arc| arc.parse::<u64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| CryptoError::InvalidInput(format!("bad attribute oid {oid}")))?;
            dn.push(DnType::from_oid(&arcs), value.clone());
        }
        Ok(dn)
    }
}

impl std::fmt::Display for SubjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self
            .entries
            .iter()
            .map(|(oid, value)| match oid.as_str() {
                COMMON_NAME => format!("CN={value}"),
                "2.5.4.10" => format!("O={value}"),
                "2.5.4.11" => format!("OU={value}"),
                "2.5.4.6" => format!("C={value}"),
                _ => format!("{oid}={value}"),
            })
            .collect();
        write!(f, "{}", rendered.join(", "))
    }
}
