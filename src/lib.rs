// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Authenticode signing for PE, CAB, and MSI files.
//!
//! This crate implements Microsoft Authenticode code signing without a
//! dependency on Windows or any Microsoft-provided tooling. It can:
//!
//! * Detect whether an input file is a PE (EXE/DLL/SYS), Microsoft Cabinet
//!   (CAB), or MSI installer (OLE compound document) container.
//! * Compute the container-specific Authenticode digest (skipping the
//!   byte ranges a signature occupies) and wrap it in a
//!   `SpcIndirectDataContent` structure.
//! * Build a PKCS#7 `SignedData` message over that content using any signer
//!   and X.509 certificate chain you provide. (See [signing::SignedMessageBuilder].)
//! * Embed, extract, and remove the resulting signature from the original
//!   container, without perturbing unrelated bytes.
//! * Obtain a counter-signature from a legacy Authenticode timestamp
//!   authority or an RFC 3161 Time-Stamp Authority. (See [timestamp].)
//! * Verify an existing signature: recompute the digest, check it against
//!   the one embedded in the signed content, and report on the signing
//!   certificate chain. (See [verify].)
//!
//! This crate does not implement the generic ASN.1/X.509/PKCS#7 primitives
//! itself; it builds on [`cryptographic_message_syntax`] and
//! [`x509_certificate`] for those. It also does not generate page hashes,
//! implement driver (kernel-mode) signing policy, or reproduce
//! Authenticode's Extended Validation UI behavior.

pub mod authenticode;
pub mod byte_window;
pub mod container;
pub mod credentials;
pub mod digest;
pub mod error;
pub mod signing;
pub mod timestamp;
pub mod verify;

pub use error::AuthenticodeError;
