//! Code signature magic numbers, slots and flags.
//!
//! All multi-byte values inside a code signature are big-endian regardless of
//! the endianness of the Mach-O slice that carries it.

// =============================================================================
// Blob magic numbers
// =============================================================================

/// SuperBlob holding an embedded signature
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;

/// CodeDirectory blob
pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;

/// Requirement set
pub const CSMAGIC_REQUIREMENTS: u32 = 0xfade0c01;

/// Single requirement expression
pub const CSMAGIC_REQUIREMENT: u32 = 0xfade0c00;

/// XML entitlements
pub const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade7171;

/// DER entitlements
pub const CSMAGIC_EMBEDDED_DER_ENTITLEMENTS: u32 = 0xfade7172;

/// Launch constraint
pub const CSMAGIC_EMBEDDED_LAUNCH_CONSTRAINT: u32 = 0xfade8181;

/// CMS signature wrapper
pub const CSMAGIC_BLOBWRAPPER: u32 = 0xfade0b01;

/// Blob magics that may appear in the index of an embedded signature.
pub const KNOWN_BLOB_MAGICS: [u32; 7] = [
    CSMAGIC_CODEDIRECTORY,
    CSMAGIC_REQUIREMENTS,
    CSMAGIC_REQUIREMENT,
    CSMAGIC_EMBEDDED_ENTITLEMENTS,
    CSMAGIC_EMBEDDED_DER_ENTITLEMENTS,
    CSMAGIC_EMBEDDED_LAUNCH_CONSTRAINT,
    CSMAGIC_BLOBWRAPPER,
];

// =============================================================================
// SuperBlob index slots
// =============================================================================

pub const CSSLOT_CODEDIRECTORY: u32 = 0x0000;
pub const CSSLOT_INFOSLOT: u32 = 0x0001;
pub const CSSLOT_REQUIREMENTS: u32 = 0x0002;
pub const CSSLOT_RESOURCEDIR: u32 = 0x0003;
pub const CSSLOT_ENTITLEMENTS: u32 = 0x0005;
pub const CSSLOT_DER_ENTITLEMENTS: u32 = 0x0007;

/// First alternate code directory (SHA-256 when SHA-1 is primary)
pub const CSSLOT_ALTERNATE_CODEDIRECTORIES: u32 = 0x1000;

/// Number of alternate code directory slots
pub const CSSLOT_ALTERNATE_CODEDIRECTORY_MAX: u32 = 5;

/// CMS signature
pub const CSSLOT_SIGNATURESLOT: u32 = 0x10000;

// =============================================================================
// Special slots inside a CodeDirectory (stored in front of the code hashes)
// =============================================================================

pub const CSSLOT_SPECIAL_INFOSLOT: usize = 1;
pub const CSSLOT_SPECIAL_REQUIREMENTS: usize = 2;
pub const CSSLOT_SPECIAL_RESOURCEDIR: usize = 3;
pub const CSSLOT_SPECIAL_ENTITLEMENTS: usize = 5;
pub const CSSLOT_SPECIAL_DER_ENTITLEMENTS: usize = 7;

/// Highest special slot the builder emits.
pub const CSSLOT_SPECIAL_MAX: usize = 7;

// =============================================================================
// Hash types
// =============================================================================

pub const CS_HASHTYPE_SHA1: u8 = 1;
pub const CS_HASHTYPE_SHA256: u8 = 2;
pub const CS_HASHTYPE_SHA384: u8 = 4;

pub const CS_SHA1_LEN: usize = 20;
pub const CS_SHA256_LEN: usize = 32;
pub const CS_SHA384_LEN: usize = 48;

// =============================================================================
// CodeDirectory flags
// =============================================================================

/// Ad-hoc signed (no identity)
pub const CS_ADHOC: u32 = 0x0000_0002;

/// Hardened runtime
pub const CS_RUNTIME: u32 = 0x0001_0000;

// =============================================================================
// Exec segment flags
// =============================================================================

/// Executable segment is main binary
pub const CS_EXECSEG_MAIN_BINARY: u64 = 0x0001;

/// Allow unsigned pages (get-task-allow, run-unsigned-code)
pub const CS_EXECSEG_ALLOW_UNSIGNED: u64 = 0x0010;

/// Process may be debugged
pub const CS_EXECSEG_DEBUGGER: u64 = 0x0020;

/// Dynamic code generation
pub const CS_EXECSEG_JIT: u64 = 0x0040;

/// Skip library validation
pub const CS_EXECSEG_SKIP_LV: u64 = 0x0080;

/// May load code by cdhash
pub const CS_EXECSEG_CAN_LOAD_CDHASH: u64 = 0x0100;

/// May execute code by cdhash
pub const CS_EXECSEG_CAN_EXEC_CDHASH: u64 = 0x0200;

// =============================================================================
// CodeDirectory versions
// =============================================================================

pub const CODEDIRECTORY_VERSION_SCATTER: u32 = 0x20100;
pub const CODEDIRECTORY_VERSION_TEAMID: u32 = 0x20200;
pub const CODEDIRECTORY_VERSION_CODELIMIT64: u32 = 0x20300;
pub const CODEDIRECTORY_VERSION_EXECSEG: u32 = 0x20400;

/// Version written by the builder
pub const CODEDIRECTORY_VERSION: u32 = CODEDIRECTORY_VERSION_EXECSEG;

/// Default code page size
pub const PAGE_SIZE: usize = 4096;

// =============================================================================
// Requirement language
// =============================================================================

pub const OP_AND: u32 = 6;
pub const OP_IDENT: u32 = 2;
pub const OP_CERT_FIELD: u32 = 11;
pub const OP_CERT_GENERIC: u32 = 14;
pub const OP_APPLE_GENERIC_ANCHOR: u32 = 15;

pub const MATCH_EXISTS: u32 = 0;
pub const MATCH_EQUAL: u32 = 1;

/// Designated requirement type in a requirement set
pub const CSREQ_DESIGNATED: u32 = 0x0003;

/// Expression kind of a single requirement
pub const REQUIREMENT_KIND_EXPR: u32 = 1;

/// Index of the leaf certificate in a certificate field expression
pub const CERT_INDEX_LEAF: i32 = 0;

/// OID 1.2.840.113635.100.6.2.1 (Apple WWDR intermediate marker), DER content bytes
pub const OID_APPLE_WWDR_INTERMEDIATE: [u8; 10] =
    [0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x06, 0x02, 0x01];
