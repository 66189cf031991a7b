//! Code requirement expressions and requirement sets.
//!
//! Only the subset needed for designated requirements is modelled. The
//! binary form is a sequence of big-endian opcodes; strings and OIDs are
//! length-prefixed and padded to 4 bytes.

use super::constants::*;
use std::fmt;

/// A requirement language expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// `identifier "com.example.app"`
    Identifier(String),
    /// `anchor apple generic`
    AppleGenericAnchor,
    /// `certificate <slot>[<field>] = "<value>"`
    CertificateField { slot: i32, field: String, value: String },
    /// `certificate <slot>[field.<oid>] exists`
    CertificateExtensionExists { slot: i32, oid: Vec<u8> },
    And(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Joins expressions with right-nested `and`.
    pub fn all(mut exprs: Vec<Expr>) -> Option<Expr> {
        let mut acc = exprs.pop()?;
        while let Some(e) = exprs.pop() {
            acc = Expr::And(Box::new(e), Box::new(acc));
        }
        Some(acc)
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            Expr::Identifier(id) => {
                buf.extend(OP_IDENT.to_be_bytes());
                write_data(buf, id.as_bytes());
            }
            Expr::AppleGenericAnchor => buf.extend(OP_APPLE_GENERIC_ANCHOR.to_be_bytes()),
            Expr::CertificateField { slot, field, value } => {
                buf.extend(OP_CERT_FIELD.to_be_bytes());
                buf.extend(slot.to_be_bytes());
                write_data(buf, field.as_bytes());
                buf.extend(MATCH_EQUAL.to_be_bytes());
                write_data(buf, value.as_bytes());
            }
            Expr::CertificateExtensionExists { slot, oid } => {
                buf.extend(OP_CERT_GENERIC.to_be_bytes());
                buf.extend(slot.to_be_bytes());
                write_data(buf, oid);
                buf.extend(MATCH_EXISTS.to_be_bytes());
            }
            Expr::And(a, b) => {
                buf.extend(OP_AND.to_be_bytes());
                a.write_to(buf);
                b.write_to(buf);
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Identifier(id) => write!(f, "identifier \"{id}\""),
            Expr::AppleGenericAnchor => f.write_str("anchor apple generic"),
            Expr::CertificateField { slot, field, value } => {
                write!(f, "certificate {}[{field}] = \"{value}\"", slot_name(*slot))
            }
            Expr::CertificateExtensionExists { slot, oid } => {
                write!(f, "certificate {}[field.{}] exists", slot_name(*slot), format_oid(oid))
            }
            Expr::And(a, b) => write!(f, "{a} and {b}"),
        }
    }
}

fn slot_name(slot: i32) -> String {
    match slot {
        CERT_INDEX_LEAF => "leaf".to_string(),
        -1 => "root".to_string(),
        n => n.to_string(),
    }
}

/// Dotted form of DER encoded OID content bytes.
fn format_oid(der: &[u8]) -> String {
    let mut arcs: Vec<u64> = Vec::new();
    let mut value = 0u64;
    for &b in der {
        value = (value << 7) | u64::from(b & 0x7f);
        if b & 0x80 == 0 {
            if arcs.is_empty() {
                let first = (value / 40).min(2);
                arcs.push(first);
                arcs.push(value - first * 40);
            } else {
                arcs.push(value);
            }
            value = 0;
        }
    }
    arcs.iter().map(u64::to_string).collect::<Vec<_>>().join(".")
}

fn write_data(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend((data.len() as u32).to_be_bytes());
    buf.extend(data);
    let pad = (4 - data.len() % 4) % 4;
    buf.extend(std::iter::repeat(0u8).take(pad));
}

/// The designated requirement for code signed by an Apple issued certificate.
///
/// `identifier "<id>" and anchor apple generic and certificate
/// leaf[subject.CN] = "<cn>" and certificate 1[field.1.2.840.113635.100.6.2.1]
/// exists`
pub fn designated_requirement(identifier: &str, leaf_common_name: &str) -> Expr {
    Expr::And(
        Box::new(Expr::Identifier(identifier.to_string())),
        Box::new(Expr::And(
            Box::new(Expr::AppleGenericAnchor),
            Box::new(Expr::And(
                Box::new(Expr::CertificateField {
                    slot: CERT_INDEX_LEAF,
                    field: "subject.CN".to_string(),
                    value: leaf_common_name.to_string(),
                }),
                Box::new(Expr::CertificateExtensionExists {
                    slot: 1,
                    oid: OID_APPLE_WWDR_INTERMEDIATE.to_vec(),
                }),
            )),
        )),
    )
}

/// A single requirement blob (0xfade0c00).
pub fn requirement_blob(expr: &Expr) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend(REQUIREMENT_KIND_EXPR.to_be_bytes());
    expr.write_to(&mut body);

    let mut blob = Vec::with_capacity(body.len() + 8);
    blob.extend(CSMAGIC_REQUIREMENT.to_be_bytes());
    blob.extend(((body.len() + 8) as u32).to_be_bytes());
    blob.extend(body);
    blob
}

/// A requirement set (0xfade0c01) from `(type, requirement blob)` pairs.
pub fn requirement_set(requirements: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let header = 12 + requirements.len() * 8;
    let total = header + requirements.iter().map(|(_, r)| r.len()).sum::<usize>();

    let mut buf = Vec::with_capacity(total);
    buf.extend(CSMAGIC_REQUIREMENTS.to_be_bytes());
    buf.extend((total as u32).to_be_bytes());
    buf.extend((requirements.len() as u32).to_be_bytes());
    let mut offset = header;
    for (kind, blob) in requirements {
        buf.extend(kind.to_be_bytes());
        buf.extend((offset as u32).to_be_bytes());
        offset += blob.len();
    }
    for (_, blob) in requirements {
        buf.extend(blob);
    }
    buf
}

/// The requirement set used by adhoc signatures.
pub fn empty_requirements() -> Vec<u8> {
    requirement_set(&[])
}

/// Requirement set holding only the designated requirement.
pub fn designated_requirements_blob(identifier: &str, leaf_common_name: &str) -> Vec<u8> {
    let expr = designated_requirement(identifier, leaf_common_name);
    requirement_set(&[(CSREQ_DESIGNATED, requirement_blob(&expr))])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn be32(buf: &[u8], off: usize) -> u32 {
        u32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
    }

    #[test]
    fn test_empty_requirements() {
        assert_eq!(
            empty_requirements(),
            vec![0xfa, 0xde, 0x0c, 0x01, 0, 0, 0, 12, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_designated_text() {
        let expr = designated_requirement("com.example.app", "Apple Development: Jane (ABC)");
        assert_eq!(
            expr.to_string(),
            "identifier \"com.example.app\" and anchor apple generic and \
             certificate leaf[subject.CN] = \"Apple Development: Jane (ABC)\" and \
             certificate 1[field.1.2.840.113635.100.6.2.1] exists"
        );
    }

    #[test]
    fn test_designated_encoding() {
        let blob = designated_requirements_blob("app", "CN");
        assert_eq!(be32(&blob, 0), CSMAGIC_REQUIREMENTS);
        assert_eq!(be32(&blob, 4) as usize, blob.len());
        assert_eq!(be32(&blob, 8), 1);
        assert_eq!(be32(&blob, 12), CSREQ_DESIGNATED);
        assert_eq!(be32(&blob, 16), 20);

        let req = &blob[20..];
        assert_eq!(be32(req, 0), CSMAGIC_REQUIREMENT);
        assert_eq!(be32(req, 4) as usize, req.len());
        assert_eq!(be32(req, 8), REQUIREMENT_KIND_EXPR);
        // and, identifier "app" padded to 4
        assert_eq!(be32(req, 12), OP_AND);
        assert_eq!(be32(req, 16), OP_IDENT);
        assert_eq!(be32(req, 20), 3);
        assert_eq!(&req[24..28], b"app\0");
        assert_eq!(be32(req, 28), OP_AND);
        assert_eq!(be32(req, 32), OP_APPLE_GENERIC_ANCHOR);
        assert_eq!(be32(req, 36), OP_AND);
        assert_eq!(be32(req, 40), OP_CERT_FIELD);
        assert!(req.ends_with(&[
            0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x06, 0x02, 0x01, 0, 0, 0, 0, 0, 0
        ]));
    }

    #[test]
    fn test_all_nests_right() {
        let expr = Expr::all(vec![
            Expr::Identifier("a".into()),
            Expr::AppleGenericAnchor,
        ])
        .unwrap();
        assert_eq!(
            expr,
            Expr::And(
                Box::new(Expr::Identifier("a".into())),
                Box::new(Expr::AppleGenericAnchor)
            )
        );
        assert!(Expr::all(vec![]).is_none());
    }
}
