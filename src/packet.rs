use std::collections::BTreeMap;

use tracing::trace;

use crate::{
    Error, Payload, Result,
    ack::{ACK_BITFIELD_BYTES, AckBitfield},
    framing::FRAME_HEADER_LEN,
    seq_nr::SeqNr,
};

/// Game state field slot. What the bytes mean is up to the game.
pub type PacketId = u8;
pub type AddonId = u16;
pub type FieldId = u16;

const FLAG_HAS_ACK: u8 = 1;

const ADDON_KIND_BYTES: u8 = 0;
const ADDON_KIND_COLLECTION: u8 = 1;

// flags, seq, ack, ack bits
const HEADER_LEN: usize = 1 + 2 + 2 + ACK_BITFIELD_BYTES;

/// Leaves room for the frame header.
pub const MAX_PACKET_LEN: usize = u16::MAX as usize - FRAME_HEADER_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddonValue {
    Bytes(Payload),
    Collection(Vec<Payload>),
}

/// Reliable payloads of a packet that was presumed lost, carried by a later packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendBlock {
    pub seq: SeqNr,
    pub payloads: Vec<Payload>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePacket {
    pub seq: SeqNr,
    pub ack: Option<SeqNr>,
    pub ack_bits: AckBitfield,
    pub fields: BTreeMap<PacketId, Payload>,
    pub addons: BTreeMap<AddonId, BTreeMap<FieldId, AddonValue>>,
    pub reliable: Vec<Payload>,
    pub resend: Vec<ResendBlock>,
}

impl UpdatePacket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_reliable_data(&self) -> bool {
        !self.reliable.is_empty() || !self.resend.is_empty()
    }

    pub fn set_field(&mut self, id: PacketId, value: Payload) {
        self.fields.insert(id, value);
    }

    /// Setting onto a collection appends to it. Anything else overwrites.
    pub fn set_addon_data(&mut self, addon: AddonId, field: FieldId, value: AddonValue) {
        let fields = self.addons.entry(addon).or_default();
        match (fields.get_mut(&field), value) {
            (Some(AddonValue::Collection(existing)), AddonValue::Collection(items)) => {
                existing.extend(items)
            }
            (Some(AddonValue::Collection(existing)), AddonValue::Bytes(item)) => {
                existing.push(item)
            }
            (_, value) => {
                fields.insert(field, value);
            }
        }
    }

    pub fn push_reliable(&mut self, payload: Payload) {
        self.reliable.push(payload);
    }

    /// Attaches the reliable payload of `lost` as a resend block. Blocks `lost` itself was
    /// carrying keep their original sequence numbers.
    pub fn merge_resend(&mut self, lost: &UpdatePacket) {
        if !lost.reliable.is_empty() {
            self.push_resend_block(ResendBlock {
                seq: lost.seq,
                payloads: lost.reliable.clone(),
            });
        }
        for block in lost.resend.iter() {
            self.push_resend_block(block.clone());
        }
    }

    fn push_resend_block(&mut self, block: ResendBlock) {
        if self.resend.iter().any(|b| b.seq == block.seq) {
            return;
        }
        self.resend.push(block);
    }

    /// Drops resend blocks for which `already_seen` returns true. Returns how many were dropped.
    pub fn drop_resends(&mut self, mut already_seen: impl FnMut(SeqNr) -> bool) -> usize {
        let before = self.resend.len();
        self.resend.retain(|b| !already_seen(b.seq));
        before - self.resend.len()
    }

    /// Moves everything that must survive a failed send into `next`. Game state fields
    /// are not carried, they get populated again every cycle.
    pub fn carry_over_into(self, next: &mut UpdatePacket) {
        for (addon, fields) in self.addons {
            for (field, value) in fields {
                next.set_addon_data(addon, field, value);
            }
        }
        let mut reliable = self.reliable;
        reliable.append(&mut next.reliable);
        next.reliable = reliable;
        for block in self.resend {
            next.push_resend_block(block);
        }
    }

    pub fn serialize(&self) -> Result<Payload> {
        let mut w = Writer::default();
        let flags = if self.ack.is_some() { FLAG_HAS_ACK } else { 0 };
        w.u8(flags);
        w.u16(*self.seq);
        w.u16(self.ack.map(|a| *a).unwrap_or(0));
        w.bytes(self.ack_bits.as_bytes());

        w.u8(count_u8(self.fields.len(), "too many fields")?);
        for (id, value) in self.fields.iter() {
            w.u8(*id);
            w.blob(value)?;
        }

        w.u16(count_u16(self.addons.len(), "too many addons")?);
        for (addon, fields) in self.addons.iter() {
            w.u16(*addon);
            w.u16(count_u16(fields.len(), "too many addon fields")?);
            for (field, value) in fields.iter() {
                w.u16(*field);
                match value {
                    AddonValue::Bytes(b) => {
                        w.u8(ADDON_KIND_BYTES);
                        w.blob(b)?;
                    }
                    AddonValue::Collection(items) => {
                        w.u8(ADDON_KIND_COLLECTION);
                        w.blobs(items)?;
                    }
                }
            }
        }

        w.blobs(&self.reliable)?;

        w.u16(count_u16(self.resend.len(), "too many resend blocks")?);
        for block in self.resend.iter() {
            w.u16(*block.seq);
            w.blobs(&block.payloads)?;
        }

        let len = w.buf.len();
        if len > MAX_PACKET_LEN {
            return Err(Error::PacketTooLarge {
                len,
                max: MAX_PACKET_LEN,
            });
        }
        Ok(w.buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Decode("packet shorter than header"));
        }
        let mut r = Reader { buf };
        let flags = r.u8()?;
        let seq = SeqNr::from(r.u16()?);
        let ack = r.u16()?;
        let ack_bits = r.array::<ACK_BITFIELD_BYTES>()?;

        let mut packet = UpdatePacket {
            seq,
            ack: (flags & FLAG_HAS_ACK != 0).then_some(SeqNr::from(ack)),
            ack_bits: AckBitfield::from_bytes(&ack_bits),
            ..Default::default()
        };

        for _ in 0..r.u8()? {
            let id = r.u8()?;
            packet.fields.insert(id, r.blob()?);
        }

        for _ in 0..r.u16()? {
            let addon = r.u16()?;
            let fields = packet.addons.entry(addon).or_default();
            for _ in 0..r.u16()? {
                let field = r.u16()?;
                let value = match r.u8()? {
                    ADDON_KIND_BYTES => AddonValue::Bytes(r.blob()?),
                    ADDON_KIND_COLLECTION => AddonValue::Collection(r.blobs()?),
                    _ => return Err(Error::Decode("unknown addon value kind")),
                };
                fields.insert(field, value);
            }
        }

        packet.reliable = r.blobs()?;

        for _ in 0..r.u16()? {
            let seq = SeqNr::from(r.u16()?);
            let payloads = r.blobs()?;
            packet.resend.push(ResendBlock { seq, payloads });
        }

        if !r.buf.is_empty() {
            trace!(trailing = r.buf.len(), "trailing bytes after update packet");
            return Err(Error::Decode("trailing bytes"));
        }

        Ok(packet)
    }
}

fn count_u8(len: usize, msg: &'static str) -> Result<u8> {
    u8::try_from(len).map_err(|_| Error::Encode(msg))
}

fn count_u16(len: usize, msg: &'static str) -> Result<u16> {
    u16::try_from(len).map_err(|_| Error::Encode(msg))
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    fn blob(&mut self, b: &[u8]) -> Result<()> {
        self.u16(count_u16(b.len(), "payload longer than u16::MAX")?);
        self.bytes(b);
        Ok(())
    }

    fn blobs(&mut self, items: &[Payload]) -> Result<()> {
        self.u16(count_u16(items.len(), "too many payloads")?);
        for item in items {
            self.blob(item)?;
        }
        Ok(())
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.buf.len() < len {
            return Err(Error::Decode("truncated update packet"));
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array::<2>()?))
    }

    fn blob(&mut self) -> Result<Payload> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn blobs(&mut self) -> Result<Vec<Payload>> {
        let count = self.u16()?;
        let mut out = Vec::with_capacity((count as usize).min(self.buf.len() / 2));
        for _ in 0..count {
            out.push(self.blob()?);
        }
        Ok(out)
    }
}
