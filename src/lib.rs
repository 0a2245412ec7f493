//! ICAO Passive Authentication (PA) for eMRTDs (Electronic Machine Readable
//! Travel Documents).
//!
//! The `emrtd-pa` crate verifies that an EF.SOD read from an eMRTD chip, and the
//! datagroup files it attests, were produced by a trusted issuing authority and
//! are unmodified, following ICAO Doc 9303-10/-12 and RFC 5652. Cryptography is
//! provided by [`openssl`](https://docs.rs/openssl/latest/openssl/), ASN.1 by
//! [`rasn`](https://docs.rs/rasn/latest/rasn/).
//!
//! Verification runs in four fixed steps with independent outcomes:
//!
//! 1. the LDS Security Object digest against the signed messageDigest attribute,
//! 2. each datagroup file digest against its LDS Security Object entry,
//! 3. the SOD signature over the re-encoded signed attributes,
//! 4. the Document Signer Certificate (DSC) against the CSCA master list,
//!    filtered by the issuing country.
//!
//! Any cryptographic or parse failure inside signature verification collapses to
//! a failed step, never a panic or a silently passing check.
//!
//! **NOTE:**
//! Please note that this crate is provided 'as is' and is not considered
//! production-ready. Use at your own risk.
//!
//! # Quick Start
//!
//! ```no_run
//! use emrtd_pa::{passive_authentication, DataGroupDir, MasterList, PaError, Sod};
//! use tracing::info;
//!
//! fn main() -> Result<(), PaError> {
//!     tracing_subscriber::fmt()
//!         .with_max_level(tracing::Level::TRACE)
//!         .init();
//!
//!     let ef_sod = std::fs::read("passport/EF_SOD.BIN").map_err(PaError::Io)?;
//!     let master_list = std::fs::read("icao_ml.ml").map_err(PaError::Io)?;
//!
//!     let sod = Sod::from_der(&ef_sod)?;
//!     let pkd = MasterList::from_der(&master_list)?;
//!
//!     let report = passive_authentication(&sod, &pkd, &DataGroupDir::new("passport"))?;
//!     info!("{report}");
//!     info!("Document verified: {}", report.verified());
//!
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

use constant_time_eq::constant_time_eq;
use core::fmt::{self, Write};
use openssl::{
    bn::{BigNum, BigNumContext},
    ec::{EcGroup, EcGroupRef, EcKey, EcPoint},
    ecdsa::EcdsaSig,
    hash::{hash, MessageDigest},
    nid::Nid,
    pkey::{PKey, Public},
    rsa::Padding,
    sign::Verifier,
};
use rasn::{
    der,
    types::{Any, Integer, ObjectIdentifier, OctetString, Oid},
};
use rasn_cms::SignerInfo;
use rasn_pkix::{Certificate, Name, SubjectPublicKeyInfo};
use std::{fs, io, path::PathBuf};
use tracing::{error, info, trace, warn};

use lds_security_object::{DataGroupHash, LdsSecurityObject};

#[derive(Debug)]
#[non_exhaustive]
pub enum PaError {
    /// An algorithm OID that is not present in any registry.
    UnknownAlgorithm(String),
    /// Structurally unusable input, e.g. a SOD without any SignerInfo.
    InvalidFileStructure(&'static str),
    /// An I/O fault other than a missing datagroup file. Fatal, not retried.
    Io(io::Error),
    OpensslErrorStack(openssl::error::ErrorStack),
    RasnEncodeError(rasn::error::EncodeError),
    RasnDecodeError(rasn::error::DecodeError),
}
impl fmt::Display for PaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::UnknownAlgorithm(ref oid) => {
                write!(f, "Unknown algorithm identifier: {oid}")
            }
            Self::InvalidFileStructure(error_msg) => {
                write!(f, "Invalid file structure: {error_msg}")
            }
            Self::Io(ref e) => fmt::Display::fmt(&e, f),
            Self::OpensslErrorStack(ref e) => fmt::Display::fmt(&e, f),
            Self::RasnEncodeError(ref e) => fmt::Display::fmt(&e, f),
            Self::RasnDecodeError(ref e) => fmt::Display::fmt(&e, f),
        }
    }
}
impl std::error::Error for PaError {}

/// RFC 5652 Section 12.1, id-signedData
const OID_SIGNED_DATA: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 7, 2]);
/// RFC 5652 Section 11.2, id-messageDigest
const OID_MESSAGE_DIGEST: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 9, 4]);
/// ICAO Doc 9303-10 Section 4.6.2, id-icao-mrtd-security-ldsSecurityObject
const OID_LDS_SECURITY_OBJECT: &Oid = Oid::const_new(&[2, 23, 136, 1, 1, 1]);
/// ICAO Doc 9303-12 Section 9, id-icao-cscaMasterList
const OID_CSCA_MASTER_LIST: &Oid = Oid::const_new(&[2, 23, 136, 1, 1, 2]);
/// RFC 5280 Section A.1, id-at-countryName
const OID_COUNTRY_NAME: &Oid = Oid::const_new(&[2, 5, 4, 6]);

/// Generated and edited using `rasn_compiler`
/// <https://librasn.github.io>
///
/// ASN.1 schema of the LDS Security Object carried in the EF.SOD eContent,
/// ICAO Doc 9303-10 Appendix D:
///
/// ```text
/// LDSSecurityObject ::= SEQUENCE {
///   version LDSSecurityObjectVersion,
///   hashAlgorithm DigestAlgorithmIdentifier,
///   dataGroupHashValues SEQUENCE SIZE (2..ub-DataGroups) OF DataGroupHash,
///   ldsVersionInfo LDSVersionInfo OPTIONAL }
///
/// DataGroupHash ::= SEQUENCE {
///   dataGroupNumber DataGroupNumber,
///   dataGroupHashValue OCTET STRING }
/// ```
pub mod lds_security_object {
    use rasn::prelude::*;
    use rasn_cms::AlgorithmIdentifier;

    pub type DataGroupNumber = Integer;
    pub type DigestAlgorithmIdentifier = AlgorithmIdentifier;
    pub type LdsSecurityObjectVersion = Integer;

    #[derive(AsnType, Debug, Clone, Decode, Encode, PartialEq, Eq)]
    pub struct DataGroupHash {
        pub data_group_number: DataGroupNumber,
        pub data_group_hash_value: OctetString,
    }
    #[derive(AsnType, Debug, Clone, Decode, Encode, PartialEq, Eq)]
    pub struct LdsSecurityObject {
        pub version: LdsSecurityObjectVersion,
        pub hash_algorithm: DigestAlgorithmIdentifier,
        #[rasn(size("2..=16"))]
        pub data_group_hash_values: SequenceOf<DataGroupHash>,
        pub lds_version_info: Option<LdsVersionInfo>,
    }
    #[derive(AsnType, Debug, Clone, Decode, Encode, PartialEq, Eq)]
    pub struct LdsVersionInfo {
        pub lds_version: PrintableString,
        pub unicode_version: PrintableString,
    }
}

/// Generated and edited using `rasn_compiler`
/// <https://librasn.github.io>
///
/// ASN.1 schema of the CSCA Master List eContent, ICAO Doc 9303-12 Section 9:
///
/// ```text
/// CscaMasterList ::= SEQUENCE {
///   version CscaMasterListVersion,
///   certList SET OF Certificate }
/// ```
pub mod csca_master_list {
    use rasn::prelude::*;
    use rasn_pkix::Certificate;

    pub type CscaMasterListCertList = SetOf<Certificate>;
    pub type CscaMasterListVersion = Integer;

    #[derive(AsnType, Debug, Clone, Decode, Encode, PartialEq, Eq)]
    pub struct CscaMasterList {
        pub version: CscaMasterListVersion,
        pub cert_list: CscaMasterListCertList,
    }
}

/// A parsed EF.SOD (Document Security Object), reduced to the fields passive
/// authentication consumes.
///
/// The verification engine never decodes DER itself; it works on this parsed
/// model. [`Sod::from_der`] maps a raw EF.SOD file onto it, but any other
/// decoder producing the same fields works as well.
#[derive(Debug, Clone)]
pub struct Sod {
    /// The LDS Security Object listing the attested datagroup hashes.
    pub lds_object: LdsSecurityObject,
    /// The CMS SignerInfos; eMRTDs carry exactly one
    /// (ICAO Doc 9303-10 Section 4.6.2.2).
    pub signer_infos: Vec<SignerInfo>,
    /// The embedded certificate set; the Document Signer Certificate comes
    /// first.
    pub certificates: Vec<Certificate>,
}

impl Sod {
    /// Parses an EF.SOD file into the [`Sod`] model.
    ///
    /// Accepts both the raw file (CMS ContentInfo wrapped in the application
    /// tag `0x77`, ICAO Doc 9303-10 Section 4.6.2) and a bare ContentInfo.
    /// Only structural validation is performed here; all cryptographic checks
    /// belong to [`passive_authentication`].
    ///
    /// # Errors
    ///
    /// * `PaError` if decoding fails or a mandatory CMS field is missing.
    pub fn from_der(ef_sod: &[u8]) -> Result<Self, PaError> {
        let content_info_bytes = if ef_sod.first() == Some(&0x77) {
            strip_tlv(ef_sod)?
        } else {
            ef_sod
        };

        // RFC 5652 Section 12.1:
        //
        // ContentInfo ::= SEQUENCE {
        //   contentType ContentType,
        //   content [0] EXPLICIT ANY DEFINED BY contentType }
        let content_info = der::decode::<rasn_cms::ContentInfo>(content_info_bytes)
            .map_err(PaError::RasnDecodeError)?;
        if content_info.content_type.ne(OID_SIGNED_DATA) {
            error!("SOD ContentInfo contentType OID must be id-signedData");
            return Err(PaError::InvalidFileStructure(
                "SOD ContentInfo contentType OID must be id-signedData",
            ));
        }

        let signed_data = der::decode::<rasn_cms::SignedData>(content_info.content.as_bytes())
            .map_err(PaError::RasnDecodeError)?;

        // ICAO Doc 9303-10 Section 4.6.2.2: always set to V3 for eMRTDs.
        if signed_data.version.ne(&Integer::from(3)) {
            error!("SOD SignedData version must be V3");
            return Err(PaError::InvalidFileStructure(
                "SOD SignedData version must be V3",
            ));
        }
        if signed_data
            .encap_content_info
            .content_type
            .ne(OID_LDS_SECURITY_OBJECT)
        {
            error!("SOD encapContentInfo OID must be id-icao-mrtd-security-ldsSecurityObject");
            return Err(PaError::InvalidFileStructure(
                "SOD encapContentInfo OID must be id-icao-mrtd-security-ldsSecurityObject",
            ));
        }
        let Some(lds_bytes) = signed_data.encap_content_info.content else {
            error!("SOD SignedData must contain the LDSSecurityObject eContent");
            return Err(PaError::InvalidFileStructure(
                "SOD SignedData must contain the LDSSecurityObject eContent",
            ));
        };
        let lds_object =
            der::decode::<LdsSecurityObject>(&lds_bytes).map_err(PaError::RasnDecodeError)?;
        if lds_object.data_group_hash_values.len() < 2
            || lds_object.data_group_hash_values.len() > 16
        {
            error!("LDSSecurityObject must list between 2 and 16 datagroup hashes");
            return Err(PaError::InvalidFileStructure(
                "LDSSecurityObject must list between 2 and 16 datagroup hashes",
            ));
        }

        let mut certificates = Vec::new();
        for cert in signed_data.certificates.iter().flatten() {
            if let rasn_cms::CertificateChoices::Certificate(cert) = cert {
                certificates.push((**cert).clone());
            }
        }

        let mut signer_infos = Vec::new();
        for signer_info in &signed_data.signer_infos {
            signer_infos.push(signer_info.clone());
        }
        if signer_infos.is_empty() {
            error!("SOD SignedData signerInfos can not be empty");
            return Err(PaError::InvalidFileStructure(
                "SOD SignedData signerInfos can not be empty",
            ));
        }

        Ok(Self {
            lds_object,
            signer_infos,
            certificates,
        })
    }
}

/// The set of trusted country signing (CSCA) certificates, i.e. a parsed PKD
/// master list.
///
/// Trust in the master list itself (the master list signer chain) is out of
/// scope here; [`MasterList::from_der`] validates structure only.
#[derive(Debug, Clone, Default)]
pub struct MasterList {
    pub certificates: Vec<Certificate>,
}

impl MasterList {
    /// Wraps an already parsed certificate set.
    #[must_use]
    pub fn from_certificates(certificates: Vec<Certificate>) -> Self {
        Self { certificates }
    }

    /// Parses a CSCA Master List as distributed through the ICAO PKD
    /// (a CMS ContentInfo carrying a CscaMasterList eContent,
    /// ICAO Doc 9303-12 Section 9).
    ///
    /// # Errors
    ///
    /// * `PaError` if decoding fails or a mandatory CMS field is missing.
    pub fn from_der(master_list: &[u8]) -> Result<Self, PaError> {
        let content_info =
            der::decode::<rasn_cms::ContentInfo>(master_list).map_err(PaError::RasnDecodeError)?;
        if content_info.content_type.ne(OID_SIGNED_DATA) {
            error!("Master List ContentInfo contentType OID must be id-signedData");
            return Err(PaError::InvalidFileStructure(
                "Master List ContentInfo contentType OID must be id-signedData",
            ));
        }

        let signed_data = der::decode::<rasn_cms::SignedData>(content_info.content.as_bytes())
            .map_err(PaError::RasnDecodeError)?;
        if signed_data
            .encap_content_info
            .content_type
            .ne(OID_CSCA_MASTER_LIST)
        {
            error!("Master List encapContentInfo OID must be id-icao-cscaMasterList");
            return Err(PaError::InvalidFileStructure(
                "Master List encapContentInfo OID must be id-icao-cscaMasterList",
            ));
        }
        let Some(master_list_bytes) = signed_data.encap_content_info.content else {
            error!("Master List SignedData must contain the CscaMasterList eContent");
            return Err(PaError::InvalidFileStructure(
                "Master List SignedData must contain the CscaMasterList eContent",
            ));
        };

        let csca_master_list = der::decode::<csca_master_list::CscaMasterList>(&master_list_bytes)
            .map_err(PaError::RasnDecodeError)?;
        // ICAO Doc 9303-12 Section 9: CscaMasterListVersion is always V0.
        if csca_master_list.version.ne(&Integer::from(0)) {
            error!("Master List CscaMasterListVersion must be V0");
            return Err(PaError::InvalidFileStructure(
                "Master List CscaMasterListVersion must be V0",
            ));
        }

        let mut certificates = Vec::new();
        for certificate in csca_master_list.cert_list {
            certificates.push(certificate);
        }
        info!(
            "Parsed master list with {} certificate(s)",
            certificates.len()
        );

        Ok(Self { certificates })
    }
}

/// Strips a single outer TLV and returns its value, rejecting trailing bytes.
fn strip_tlv(data: &[u8]) -> Result<&[u8], PaError> {
    let rest = data
        .get(1..)
        .ok_or(PaError::InvalidFileStructure("truncated TLV"))?;
    let (header_len, value_len) = match rest.first() {
        Some(&first) if first & 0x80 == 0 => (1_usize, usize::from(first)),
        Some(&first) => {
            let length_of_length = usize::from(first & 0x7F);
            if length_of_length == 0 || length_of_length > core::mem::size_of::<usize>() {
                return Err(PaError::InvalidFileStructure(
                    "unsupported TLV length encoding",
                ));
            }
            let Some(length_bytes) = rest.get(1..1 + length_of_length) else {
                return Err(PaError::InvalidFileStructure("truncated TLV length"));
            };
            let mut value_len = 0_usize;
            for &byte in length_bytes {
                value_len = value_len << 8 | usize::from(byte);
            }
            (1 + length_of_length, value_len)
        }
        None => return Err(PaError::InvalidFileStructure("truncated TLV")),
    };
    let end = header_len
        .checked_add(value_len)
        .ok_or(PaError::InvalidFileStructure("TLV length overflow"))?;
    match rest.get(header_len..end) {
        Some(value) if rest.len() == end => Ok(value),
        _ => Err(PaError::InvalidFileStructure(
            "TLV length does not match the file size",
        )),
    }
}

/// Helper function that converts a byte slice into a hex string.
///
/// # Example
///
/// ```
/// use emrtd_pa::bytes2hex;
/// let hex_string = bytes2hex(&[0xDE, 0xAD, 0xBE, 0xEF]);
/// assert_eq!(hex_string, "DEADBEEF");
/// ```
#[must_use]
pub fn bytes2hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut acc, &byte| {
        write!(&mut acc, "{byte:02X}").expect("Failed to write to string");
        acc
    })
}

fn oid2string(oid: &Oid) -> String {
    oid.iter().map(u32::to_string).collect::<Vec<_>>().join(".")
}

/// Digest registry: maps a digest algorithm OID to its `openssl` digest.
///
/// Extension means adding entries here only. The RSA and ECDSA signature
/// scheme OIDs live in their own, disjoint registries below; an identifier
/// naming a hash and an identifier naming a signature scheme that implies a
/// hash are different things and must never share a table.
fn oid2digestalg(oid: &Oid) -> Result<MessageDigest, PaError> {
    let digest_alg_oids: [(&Oid, MessageDigest); 4] = [
        (Oid::const_new(&[1, 3, 14, 3, 2, 26]), MessageDigest::sha1()),
        (
            Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 2, 1]),
            MessageDigest::sha256(),
        ),
        (
            Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 2, 2]),
            MessageDigest::sha384(),
        ),
        (
            Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 2, 3]),
            MessageDigest::sha512(),
        ),
    ];
    for (digest_oid, digest) in digest_alg_oids {
        if oid.eq(digest_oid) {
            return Ok(digest);
        }
    }
    error!("Unknown digest algorithm OID: {}", oid2string(oid));
    Err(PaError::UnknownAlgorithm(oid2string(oid)))
}

/// Hashes `data` with the digest named by `oid`.
///
/// Registered digests are SHA-1, SHA-256, SHA-384 and SHA-512.
///
/// # Errors
///
/// * `PaError::UnknownAlgorithm` if `oid` is not a registered digest OID.
///
/// # Example
///
/// ```
/// # use emrtd_pa::PaError;
/// #
/// # fn main() -> Result<(), PaError> {
/// use emrtd_pa::digest_with_oid;
/// use rasn::types::Oid;
///
/// let digest = digest_with_oid(Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 2, 1]), b"abc")?;
/// assert_eq!(digest.len(), 32);
/// #
/// #     Ok(())
/// # }
/// ```
pub fn digest_with_oid(oid: &Oid, data: &[u8]) -> Result<Vec<u8>, PaError> {
    let digest = oid2digestalg(oid)?;
    let digest_bytes = hash(digest, data).map_err(PaError::OpensslErrorStack)?;
    Ok(digest_bytes.to_vec())
}

/// RSA signature scheme registry: maps an RSA signature algorithm OID to the
/// digest it implies, RFC 8017 Appendix A.2.4. Used by RSA-PSS verification
/// and, through membership, by [`SignatureScheme::resolve`].
fn rsa_signature_digest(oid: &Oid) -> Option<MessageDigest> {
    let rsa_sig_oids: [(&Oid, MessageDigest); 5] = [
        (
            Oid::const_new(&[1, 2, 840, 113549, 1, 1, 5]),
            MessageDigest::sha1(),
        ),
        (
            Oid::const_new(&[1, 2, 840, 113549, 1, 1, 14]),
            MessageDigest::sha224(),
        ),
        (
            Oid::const_new(&[1, 2, 840, 113549, 1, 1, 11]),
            MessageDigest::sha256(),
        ),
        (
            Oid::const_new(&[1, 2, 840, 113549, 1, 1, 12]),
            MessageDigest::sha384(),
        ),
        (
            Oid::const_new(&[1, 2, 840, 113549, 1, 1, 13]),
            MessageDigest::sha512(),
        ),
    ];
    rsa_sig_oids
        .into_iter()
        .find(|(sig_oid, _)| oid.eq(*sig_oid))
        .map(|(_, digest)| digest)
}

/// ECDSA signature scheme registry: ecdsa-with-SHA* OIDs, RFC 5758 Section 3.2.
fn ecdsa_signature_digest(oid: &Oid) -> Option<MessageDigest> {
    let ecdsa_sig_oids: [(&Oid, MessageDigest); 5] = [
        (
            Oid::const_new(&[1, 2, 840, 10045, 4, 1]),
            MessageDigest::sha1(),
        ),
        (
            Oid::const_new(&[1, 2, 840, 10045, 4, 3, 1]),
            MessageDigest::sha224(),
        ),
        (
            Oid::const_new(&[1, 2, 840, 10045, 4, 3, 2]),
            MessageDigest::sha256(),
        ),
        (
            Oid::const_new(&[1, 2, 840, 10045, 4, 3, 3]),
            MessageDigest::sha384(),
        ),
        (
            Oid::const_new(&[1, 2, 840, 10045, 4, 3, 4]),
            MessageDigest::sha512(),
        ),
    ];
    ecdsa_sig_oids
        .into_iter()
        .find(|(sig_oid, _)| oid.eq(*sig_oid))
        .map(|(_, digest)| digest)
}

/// Named curve registry: the curves ICAO Doc 9303-12 allows for CSCA and DSC
/// keys, NIST P-192..P-521 and brainpoolP192r1..brainpoolP512r1.
fn named_curve_nid(oid: &Oid) -> Option<Nid> {
    let curve_oids: [(&Oid, Nid); 11] = [
        (
            Oid::const_new(&[1, 2, 840, 10045, 3, 1, 1]),
            Nid::X9_62_PRIME192V1,
        ),
        (
            Oid::const_new(&[1, 2, 840, 10045, 3, 1, 7]),
            Nid::X9_62_PRIME256V1,
        ),
        (Oid::const_new(&[1, 3, 132, 0, 33]), Nid::SECP224R1),
        (Oid::const_new(&[1, 3, 132, 0, 34]), Nid::SECP384R1),
        (Oid::const_new(&[1, 3, 132, 0, 35]), Nid::SECP521R1),
        (
            Oid::const_new(&[1, 3, 36, 3, 3, 2, 8, 1, 1, 3]),
            // NID_brainpoolP192r1; the openssl crate exposes no named constant for it.
            Nid::from_raw(923),
        ),
        (
            Oid::const_new(&[1, 3, 36, 3, 3, 2, 8, 1, 1, 5]),
            Nid::BRAINPOOL_P224R1,
        ),
        (
            Oid::const_new(&[1, 3, 36, 3, 3, 2, 8, 1, 1, 7]),
            Nid::BRAINPOOL_P256R1,
        ),
        (
            Oid::const_new(&[1, 3, 36, 3, 3, 2, 8, 1, 1, 9]),
            Nid::BRAINPOOL_P320R1,
        ),
        (
            Oid::const_new(&[1, 3, 36, 3, 3, 2, 8, 1, 1, 11]),
            Nid::BRAINPOOL_P384R1,
        ),
        (
            Oid::const_new(&[1, 3, 36, 3, 3, 2, 8, 1, 1, 13]),
            Nid::BRAINPOOL_P512R1,
        ),
    ];
    curve_oids
        .into_iter()
        .find(|(curve_oid, _)| oid.eq(*curve_oid))
        .map(|(_, nid)| nid)
}

/// Encodes `data` as PEM: base64 wrapped at 64 columns between BEGIN/END
/// markers, header upper-cased.
///
/// # Example
///
/// ```
/// use emrtd_pa::pem_encode;
/// let pem = pem_encode(&[0u8; 48], "public key");
/// assert_eq!(
///     pem,
///     "-----BEGIN PUBLIC KEY-----\n\
///      AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\n\
///      -----END PUBLIC KEY-----"
/// );
/// ```
#[must_use]
pub fn pem_encode(data: &[u8], header: &str) -> String {
    let header = header.to_uppercase();
    let base64 = openssl::base64::encode_block(data);
    let mut pem = format!("-----BEGIN {header}-----\n");
    for chunk in base64.as_bytes().chunks(64) {
        pem.push_str(core::str::from_utf8(chunk).expect("base64 output is ASCII"));
        pem.push('\n');
    }
    write!(&mut pem, "-----END {header}-----").expect("Failed to write to string");
    pem
}

/// The signature scheme a certificate declares, resolved once from its
/// signatureAlgorithm OID.
///
/// Resolution happens in the identifier's own namespace: RSA scheme OIDs map
/// to [`SignatureScheme::RsaPss`], ecdsa-with-SHA* OIDs to
/// [`SignatureScheme::Ecdsa`], and anything else is
/// [`PaError::UnknownAlgorithm`] rather than an assumed default.
#[derive(Clone, Copy)]
pub enum SignatureScheme {
    /// ECDSA over the curve named by the subjectPublicKeyInfo parameters.
    Ecdsa { digest: MessageDigest },
    /// RSA with PSS padding, digest from the RSA scheme registry.
    RsaPss { digest: MessageDigest },
}

impl SignatureScheme {
    /// Resolves the scheme of `cert` from its declared signatureAlgorithm.
    ///
    /// # Errors
    ///
    /// * `PaError::UnknownAlgorithm` if the OID is in neither signature scheme
    ///   registry.
    pub fn resolve(cert: &Certificate) -> Result<Self, PaError> {
        let oid = &cert.signature_algorithm.algorithm;
        if let Some(digest) = rsa_signature_digest(oid) {
            return Ok(Self::RsaPss { digest });
        }
        if let Some(digest) = ecdsa_signature_digest(oid) {
            return Ok(Self::Ecdsa { digest });
        }
        error!("Unknown signature algorithm OID: {}", oid2string(oid));
        Err(PaError::UnknownAlgorithm(oid2string(oid)))
    }
}

impl fmt::Debug for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Ecdsa { digest } => write!(f, "Ecdsa({:?})", digest.type_()),
            Self::RsaPss { digest } => write!(f, "RsaPss({:?})", digest.type_()),
        }
    }
}

/// Internal verification outcome. The distinction between a parse problem and
/// a genuine mismatch exists for diagnostics only; both collapse to `false` at
/// the public boundary.
enum VerifyFailure {
    Parse(&'static str),
    Mismatch,
}

/// Verifies `signature` over `message` against the public key of `cert`.
///
/// Dispatches between ECDSA and RSA-PSS based on the certificate's declared
/// signatureAlgorithm. Fail-closed: any parse or cryptographic failure,
/// including an unknown algorithm or curve, yields `false`; this function
/// never panics or returns an error. Stateless, safe for concurrent use.
#[must_use]
pub fn verify_signature(cert: &Certificate, message: &[u8], signature: &[u8]) -> bool {
    let scheme = match SignatureScheme::resolve(cert) {
        Ok(scheme) => scheme,
        // resolve already logged the unknown OID
        Err(_) => return false,
    };
    trace!("Verifying with {scheme:?}");
    let outcome = match scheme {
        SignatureScheme::Ecdsa { digest } => verify_ecdsa(cert, digest, message, signature),
        SignatureScheme::RsaPss { digest } => verify_rsa_pss(cert, digest, message, signature),
    };
    match outcome {
        Ok(()) => true,
        Err(VerifyFailure::Parse(reason)) => {
            warn!("Signature verification failed before the cryptographic check: {reason}");
            false
        }
        Err(VerifyFailure::Mismatch) => {
            trace!("Signature does not verify against the certificate public key");
            false
        }
    }
}

/// Builds an EC public key from a subjectPublicKeyInfo.
///
/// Named curves resolve through the curve registry and the raw key bytes are
/// interpreted as an uncompressed point; explicit domain parameters fall back
/// to re-encoding the SPKI and letting openssl resolve them.
fn ec_public_key(spki: &SubjectPublicKeyInfo) -> Result<EcKey<Public>, VerifyFailure> {
    let Some(parameters) = &spki.algorithm.parameters else {
        return Err(VerifyFailure::Parse(
            "subjectPublicKeyInfo has no EC domain parameters",
        ));
    };
    if let Ok(curve_oid) = der::decode::<ObjectIdentifier>(parameters.as_bytes()) {
        let nid =
            named_curve_nid(&curve_oid).ok_or(VerifyFailure::Parse("unsupported named curve"))?;
        let group = EcGroup::from_curve_name(nid)
            .map_err(|_| VerifyFailure::Parse("curve is not available"))?;
        let mut ctx = BigNumContext::new().map_err(|_| VerifyFailure::Parse("bignum context"))?;
        let point = EcPoint::from_bytes(&group, spki.subject_public_key.as_raw_slice(), &mut ctx)
            .map_err(|_| VerifyFailure::Parse("public key is not an uncompressed curve point"))?;
        EcKey::from_public_key(&group, &point)
            .map_err(|_| VerifyFailure::Parse("invalid EC public key"))
    } else {
        let spki_der = der::encode(spki)
            .map_err(|_| VerifyFailure::Parse("subjectPublicKeyInfo re-encoding failed"))?;
        let pkey = PKey::public_key_from_der(&spki_der)
            .map_err(|_| VerifyFailure::Parse("unparseable subjectPublicKeyInfo"))?;
        pkey.ec_key()
            .map_err(|_| VerifyFailure::Parse("not an EC public key"))
    }
}

/// Rewrites an ECDSA signature to its canonical low-S form. `(r, s)` and
/// `(r, n - s)` verify the same message, so the rewrite never changes validity.
fn normalize_low_s(
    sig: EcdsaSig,
    group: &EcGroupRef,
) -> Result<EcdsaSig, openssl::error::ErrorStack> {
    let mut ctx = BigNumContext::new()?;
    let mut order = BigNum::new()?;
    group.order(&mut order, &mut ctx)?;
    let mut half_order = BigNum::new()?;
    half_order.rshift1(&order)?;
    if sig.s() <= &*half_order {
        return Ok(sig);
    }
    let r = sig.r().to_owned()?;
    let mut low_s = BigNum::new()?;
    low_s.checked_sub(&order, sig.s())?;
    EcdsaSig::from_private_components(r, low_s)
}

fn verify_ecdsa(
    cert: &Certificate,
    digest: MessageDigest,
    message: &[u8],
    signature: &[u8],
) -> Result<(), VerifyFailure> {
    let ec_key = ec_public_key(&cert.tbs_certificate.subject_public_key_info)?;
    let digest_bytes = hash(digest, message)
        .map_err(|_| VerifyFailure::Parse("message digest computation failed"))?;
    let sig = EcdsaSig::from_der(signature)
        .map_err(|_| VerifyFailure::Parse("malformed DER ECDSA signature"))?;
    let sig = normalize_low_s(sig, ec_key.group())
        .map_err(|_| VerifyFailure::Parse("ECDSA signature normalization failed"))?;
    match sig.verify(&digest_bytes, &ec_key) {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => Err(VerifyFailure::Mismatch),
    }
}

fn verify_rsa_pss(
    cert: &Certificate,
    digest: MessageDigest,
    message: &[u8],
    signature: &[u8],
) -> Result<(), VerifyFailure> {
    let spki_der = der::encode(&cert.tbs_certificate.subject_public_key_info)
        .map_err(|_| VerifyFailure::Parse("subjectPublicKeyInfo re-encoding failed"))?;
    let pem = pem_encode(&spki_der, "public key");
    let pkey = PKey::public_key_from_pem(pem.as_bytes())
        .map_err(|_| VerifyFailure::Parse("unparseable RSA public key"))?;
    let mut verifier = Verifier::new(digest, &pkey)
        .map_err(|_| VerifyFailure::Parse("verifier construction failed"))?;
    verifier
        .set_rsa_padding(Padding::PKCS1_PSS)
        .map_err(|_| VerifyFailure::Parse("PSS padding is not supported for this key"))?;
    match verifier.verify_oneshot(signature, message) {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => Err(VerifyFailure::Mismatch),
    }
}

/// Decodes a PrintableString or UTF8String attribute value. Enough for subject
/// country codes, which are always short-form two-character strings.
fn directory_string(value: &Any) -> Option<&str> {
    let bytes = value.as_bytes();
    if bytes.len() < 2 || bytes[1] & 0x80 != 0 || usize::from(bytes[1]) != bytes.len() - 2 {
        return None;
    }
    // PrintableString or UTF8String
    if bytes[0] != 0x13 && bytes[0] != 0x0C {
        return None;
    }
    core::str::from_utf8(&bytes[2..]).ok()
}

/// Extracts the countryName attribute value from the certificate subject.
#[must_use]
pub fn subject_country_code(cert: &Certificate) -> Option<String> {
    let Name::RdnSequence(rdn_sequence) = &cert.tbs_certificate.subject;
    for rdn in rdn_sequence {
        for attribute in rdn.iter() {
            if attribute.r#type.eq(OID_COUNTRY_NAME) {
                return directory_string(&attribute.value).map(str::to_owned);
            }
        }
    }
    None
}

/// Selects the certificates whose subject countryName equals `code`, exact
/// case-sensitive comparison, input order preserved. Never fails; no match
/// yields an empty vector.
///
/// Filtering the master list by country before any signature check is what
/// keeps step 4 affordable: every candidate costs an asymmetric verification.
#[must_use]
pub fn certs_by_country_code<'a>(
    certificates: &'a [Certificate],
    code: &str,
) -> Vec<&'a Certificate> {
    certificates
        .iter()
        .filter(|cert| subject_country_code(cert).as_deref() == Some(code))
        .collect()
}

/// Source of raw datagroup file contents, addressed by datagroup number.
pub trait DataGroupSource {
    /// Reads the raw contents of EF.DG`dg_number`.
    ///
    /// `Ok(None)` means the file does not exist on this document; the engine
    /// records the entry as [`StepStatus::Skipped`]. Any other I/O fault is an
    /// error and aborts the run.
    ///
    /// # Errors
    ///
    /// * `PaError::Io` on an unexpected I/O failure.
    fn read_dg(&self, dg_number: u8) -> Result<Option<Vec<u8>>, PaError>;
}

/// Reads datagroup files named `EF_DG{n}.BIN` from a directory, the layout
/// produced by common eMRTD dump tools.
#[derive(Debug, Clone)]
pub struct DataGroupDir {
    dir: PathBuf,
}

impl DataGroupDir {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl DataGroupSource for DataGroupDir {
    fn read_dg(&self, dg_number: u8) -> Result<Option<Vec<u8>>, PaError> {
        let path = self.dir.join(format!("EF_DG{dg_number}.BIN"));
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                error!("Failed to read {}: {e}", path.display());
                Err(PaError::Io(e))
            }
        }
    }
}

/// Outcome of a single verification step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Ok,
    Failed,
    Skipped,
}
impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Ok => write!(f, "OK"),
            Self::Failed => write!(f, "Failed"),
            Self::Skipped => write!(f, "Skipped"),
        }
    }
}

/// One entry of the passive authentication report. Step 2 produces one entry
/// per datagroup listed in the LDS Security Object.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub step: u8,
    pub label: String,
    pub status: StepStatus,
}

/// The ordered per-step results of a passive authentication run.
///
/// The engine reports step results independently and computes no overall
/// verdict itself; [`PassiveAuthReport::verified`] is the consumer-side
/// derivation mandated by ICAO Doc 9303-11.
#[derive(Debug, Clone)]
pub struct PassiveAuthReport {
    pub steps: Vec<StepResult>,
}

impl PassiveAuthReport {
    /// `true` when no step failed. Skipped datagroup entries are absent files,
    /// not failures, and do not count against the verdict.
    #[must_use]
    pub fn verified(&self) -> bool {
        !self.steps.is_empty()
            && self
                .steps
                .iter()
                .all(|step| step.status != StepStatus::Failed)
    }
}

impl fmt::Display for PassiveAuthReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Passive Authentication (PA):")?;
        for step in &self.steps {
            writeln!(f, "- Step {}. {}: {}", step.step, step.label, step.status)?;
        }
        Ok(())
    }
}

fn dg_number(dg_hash: &DataGroupHash) -> Result<u8, PaError> {
    // DataGroupNumber is 1..=16, ICAO Doc 9303-10 Appendix D
    (1..=16_u8)
        .find(|n| dg_hash.data_group_number == Integer::from(i32::from(*n)))
        .ok_or_else(|| {
            error!("LDS object DataGroupHash number is outside 1..=16");
            PaError::InvalidFileStructure("LDS object DataGroupHash number is outside 1..=16")
        })
}

/// Step 1: compares the messageDigest signed attribute byte-for-byte against
/// the digest of the canonically encoded LDS Security Object. The attribute
/// value is never re-hashed. An absent, duplicated or malformed attribute is a
/// failure of this step only.
fn verify_lds_object_hash(
    signer_info: &SignerInfo,
    lds_bytes: &[u8],
) -> Result<StepStatus, PaError> {
    let Some(signed_attrs) = &signer_info.signed_attrs else {
        warn!("SignerInfo carries no signed attributes");
        return Ok(StepStatus::Failed);
    };

    let mut message_digest = None;
    for signed_attr in signed_attrs {
        if !signed_attr.r#type.eq(OID_MESSAGE_DIGEST) {
            continue;
        }
        if message_digest.is_some() {
            warn!("messageDigest attribute appears more than once in signedAttrs");
            return Ok(StepStatus::Failed);
        }
        // RFC 5652 Section 11.2: MessageDigest ::= OCTET STRING, single value
        if signed_attr.values.len() != 1 {
            warn!("messageDigest attribute must carry exactly one value");
            return Ok(StepStatus::Failed);
        }
        let value = signed_attr.values.first().expect("There is only one item");
        match der::decode::<OctetString>(value.as_bytes()) {
            Ok(octets) => message_digest = Some(octets),
            Err(e) => {
                warn!("messageDigest attribute value is not an OCTET STRING: {e}");
                return Ok(StepStatus::Failed);
            }
        }
    }
    let Some(message_digest) = message_digest else {
        warn!("signedAttrs carry no messageDigest attribute");
        return Ok(StepStatus::Failed);
    };

    let lds_digest = digest_with_oid(&signer_info.digest_algorithm.algorithm, lds_bytes)?;
    if constant_time_eq(&message_digest, &lds_digest) {
        Ok(StepStatus::Ok)
    } else {
        warn!(
            "LDS object digest {} does not match the messageDigest attribute {}",
            bytes2hex(&lds_digest),
            bytes2hex(&message_digest)
        );
        Ok(StepStatus::Failed)
    }
}

/// Step 4: verifies the DSC signature against every master list certificate
/// of the DSC's own country, in list order, stopping at the first success.
fn verify_dsc_trust(dsc: &Certificate, master_list: &MasterList) -> Result<StepStatus, PaError> {
    let Some(country) = subject_country_code(dsc) else {
        warn!("Document Signer Certificate subject has no country attribute");
        return Ok(StepStatus::Failed);
    };
    let tbs_bytes = der::encode(&dsc.tbs_certificate).map_err(PaError::RasnEncodeError)?;
    let signature = dsc.signature_value.as_raw_slice();
    let candidates = certs_by_country_code(&master_list.certificates, &country);
    info!(
        "{} CSCA candidate(s) for country {country}",
        candidates.len()
    );
    for candidate in candidates {
        if verify_signature(candidate, &tbs_bytes, signature) {
            return Ok(StepStatus::Ok);
        }
    }
    Ok(StepStatus::Failed)
}

/// Performs passive authentication on a parsed SOD against a CSCA master list
/// and the document's datagroup files.
///
/// The four steps run in fixed order with independent outcomes; a failed step
/// never suppresses the remaining ones. Inputs are read-only throughout.
///
/// # Arguments
///
/// * `sod` - The parsed Document Security Object.
/// * `master_list` - The trusted CSCA certificate set.
/// * `dg_source` - Access to the datagroup files referenced by the LDS object.
///
/// # Returns
///
/// A [`PassiveAuthReport`] with one entry for step 1, one per datagroup for
/// step 2, and one each for steps 3 and 4.
///
/// # Errors
///
/// * `PaError` on an unknown digest algorithm, an unexpected I/O failure, a
///   re-encoding failure, or a SOD without any SignerInfo. Signature
///   verification failures are never errors; they are `Failed` step results.
///
/// # Examples
///
/// ```no_run
/// # use emrtd_pa::PaError;
/// #
/// # fn main() -> Result<(), PaError> {
/// use emrtd_pa::{passive_authentication, DataGroupDir, MasterList, Sod};
///
/// let sod = Sod::from_der(&std::fs::read("passport/EF_SOD.BIN").map_err(PaError::Io)?)?;
/// let pkd = MasterList::from_der(&std::fs::read("icao_ml.ml").map_err(PaError::Io)?)?;
/// let report = passive_authentication(&sod, &pkd, &DataGroupDir::new("passport"))?;
/// println!("{report}");
/// #
/// #     Ok(())
/// # }
/// ```
pub fn passive_authentication(
    sod: &Sod,
    master_list: &MasterList,
    dg_source: &impl DataGroupSource,
) -> Result<PassiveAuthReport, PaError> {
    let signer_info = match sod.signer_infos.first() {
        Some(signer_info) => signer_info,
        None => {
            error!("SOD must contain at least one SignerInfo");
            return Err(PaError::InvalidFileStructure(
                "SOD must contain at least one SignerInfo",
            ));
        }
    };

    let mut steps = Vec::with_capacity(sod.lds_object.data_group_hash_values.len() + 3);

    // Step 1. LDS object hash against the messageDigest signed attribute.
    let lds_bytes = der::encode(&sod.lds_object).map_err(PaError::RasnEncodeError)?;
    let status = verify_lds_object_hash(signer_info, &lds_bytes)?;
    info!("Step 1, LDS object hash: {status}");
    steps.push(StepResult {
        step: 1,
        label: "LDS object hash".to_owned(),
        status,
    });

    // Step 2. Datagroup hashes, one independent entry per LDS object entry.
    for dg_hash in &sod.lds_object.data_group_hash_values {
        let number = dg_number(dg_hash)?;
        let label = format!("EF_DG{number}.BIN");
        let status = match dg_source.read_dg(number)? {
            None => {
                info!("Step 2, {label} not found, skipping");
                StepStatus::Skipped
            }
            Some(bytes) => {
                let digest = digest_with_oid(&sod.lds_object.hash_algorithm.algorithm, &bytes)?;
                trace!("Step 2, {label} digest: {}", bytes2hex(&digest));
                if constant_time_eq(&digest, &dg_hash.data_group_hash_value) {
                    StepStatus::Ok
                } else {
                    warn!("Step 2, {label} hash does not match the LDS object entry");
                    StepStatus::Failed
                }
            }
        };
        info!("Step 2, {label}: {status}");
        steps.push(StepResult {
            step: 2,
            label,
            status,
        });
    }

    // Steps 3 and 4 need the Document Signer Certificate; without one both
    // are recorded as failed instead of aborting the report.
    match sod.certificates.first() {
        None => {
            error!("SOD does not embed a Document Signer Certificate");
            steps.push(StepResult {
                step: 3,
                label: "SOD signature".to_owned(),
                status: StepStatus::Failed,
            });
            steps.push(StepResult {
                step: 4,
                label: "DSC trust".to_owned(),
                status: StepStatus::Failed,
            });
        }
        Some(dsc) => {
            // Step 3. SOD signature over the re-encoded signed attributes.
            let status = match &signer_info.signed_attrs {
                None => {
                    warn!("SignerInfo carries no signed attributes");
                    StepStatus::Failed
                }
                Some(signed_attrs) => {
                    // RFC 5652 Section 5.4
                    // <https://datatracker.ietf.org/doc/html/rfc5652#section-5.4>
                    //
                    // > [...] A separate encoding of the signedAttrs field is
                    // > performed for message digest calculation. The IMPLICIT
                    // > [0] tag in the signedAttrs is not used for the DER
                    // > encoding, rather an EXPLICIT SET OF tag is used.
                    let mut signed_attrs_bytes =
                        der::encode(signed_attrs).map_err(PaError::RasnEncodeError)?;
                    signed_attrs_bytes[0] = 0x31;
                    if verify_signature(dsc, &signed_attrs_bytes, &signer_info.signature) {
                        StepStatus::Ok
                    } else {
                        StepStatus::Failed
                    }
                }
            };
            info!("Step 3, SOD signature: {status}");
            steps.push(StepResult {
                step: 3,
                label: "SOD signature".to_owned(),
                status,
            });

            // Step 4. DSC trust against the country-filtered master list.
            let status = verify_dsc_trust(dsc, master_list)?;
            info!("Step 4, DSC trust: {status}");
            steps.push(StepResult {
                step: 4,
                label: "DSC trust".to_owned(),
                status,
            });
        }
    }

    Ok(PassiveAuthReport { steps })
}
