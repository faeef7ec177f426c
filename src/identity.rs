use std::fmt::{Debug, Display, Formatter};

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};

/// An opaque network identity - the address vocabulary of the underlying message
///  transport. The engine never interprets its contents; it only compares, hashes
///  and serializes them (length-prefixed) into SYN / ping packets.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Identity(Bytes);

impl Identity {
    pub const MAX_LEN: usize = u16::MAX as usize;

    pub fn from_bytes(raw: impl Into<Bytes>) -> Identity {
        Identity(raw.into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn serialized_len(&self) -> usize {
        2 + self.0.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.0.len() as u16);
        buf.put_slice(&self.0);
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<(Identity, usize)> {
        if buf.len() < 2 {
            bail!("identity field truncated: {} bytes", buf.len());
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if buf.len() < 2 + len {
            bail!("identity of declared length {} overruns buffer of {}", len, buf.len());
        }
        Ok((Identity(Bytes::copy_from_slice(&buf[2..2 + len])), 2 + len))
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // identities tend to be long hashes - an abbreviated prefix is enough for correlation
        for b in self.0.iter().take(4) {
            write!(f, "{:02x}", b)?;
        }
        if self.0.len() > 4 {
            write!(f, "…")?;
        }
        Ok(())
    }
}

impl Debug for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", self)
    }
}

/// Detached signature over an encoded packet with the signature field zeroed out.
#[derive(Clone, Eq, PartialEq)]
pub struct Signature(pub [u8; Signature::LEN]);

impl Signature {
    pub const LEN: usize = 64;

    pub const ZERO: Signature = Signature([0u8; Signature::LEN]);

    pub fn from_slice(raw: &[u8]) -> anyhow::Result<Signature> {
        if raw.len() != Signature::LEN {
            bail!("signature must be {} bytes, got {}", Signature::LEN, raw.len());
        }
        let mut data = [0u8; Signature::LEN];
        data.copy_from_slice(raw);
        Ok(Signature(data))
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature(")?;
        for b in self.0.iter().take(4) {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "…)")
    }
}

/// The signing collaborator. SYN / CLOSE / RESET packets (and any packet sent while the
///  peer has requested signatures) are signed with the local identity's key; inbound
///  packets of those classes are verified against the identity they claim to come from.
#[cfg_attr(test, mockall::automock)]
pub trait Signer: Send + Sync + 'static {
    fn local_identity(&self) -> Identity;

    fn sign(&self, data: &[u8]) -> Signature;

    fn verify(&self, signature: &Signature, data: &[u8], from: &Identity) -> bool;
}
