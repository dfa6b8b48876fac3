//! The Logical Link Control and Adaptation Protocol (L2CAP).
//!
//! Only the single fixed channel this stack needs is implemented: the Attribute Protocol channel
//! (`0x0004`). LE Bluetooth also reserves a signaling channel (`0x0005`) and a Security Manager
//! channel (`0x0006`), but since this stack never establishes dynamic channels or runs pairing,
//! nothing ever needs to be sent or received on them; inbound traffic addressed to any channel
//! other than ATT is simply dropped.
//!
//! L2CAP PDUs sent over the LE data channel can be larger than a single LL data PDU allows
//! (`MIN_DATA_PAYLOAD_BUF`, 27 Bytes). The L2CAP header carries the total SDU length, and the LL
//! data PDU header's `LLID` field tells us whether a data PDU starts a new SDU or continues one
//! already in progress. This module reassembles incoming fragments into a complete SDU and
//! fragments outgoing ones the same way.

use crate::{
    bytes::*,
    link::{
        data::Llid,
        queue::Producer,
        MIN_DATA_PAYLOAD_BUF,
    },
    Error,
};

/// The channel identifier (CID) used by the Attribute Protocol.
pub const ATT_CID: u16 = 0x0004;

/// Largest ATT PDU this stack will reassemble, matching the largest ATT MTU it will ever
/// negotiate (see `att::client::MAX_MTU`).
pub const MAX_SDU_LEN: usize = 247;

/// Size of the L2CAP Basic L2CAP header: a 16-bit length followed by a 16-bit channel ID.
const HEADER_LEN: usize = 4;

/// The L2CAP Basic L2CAP header preceding every first fragment of an SDU.
#[derive(Debug, Copy, Clone)]
struct Header {
    /// Length of the following payload, *after* reassembly.
    length: u16,
    channel: u16,
}

impl FromBytes<'_> for Header {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        Ok(Self {
            length: bytes.read_u16_le()?,
            channel: bytes.read_u16_le()?,
        })
    }
}

impl ToBytes for Header {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_le(self.length)?;
        writer.write_u16_le(self.channel)
    }
}

/// Reassembles L2CAP SDUs addressed to the ATT channel out of a sequence of LL data PDUs.
///
/// One instance is enough for the single connection this stack ever maintains; L2CAP basic mode
/// has no concept of interleaving two SDUs on the same channel, so there is never more than one
/// reassembly in flight.
pub struct Reassembler {
    buf: [u8; MAX_SDU_LEN],
    /// Total SDU length as declared by the `Header` of the fragment that started it.
    want: usize,
    /// Bytes copied into `buf` so far.
    have: usize,
    /// Whether a reassembly is currently in progress (as opposed to having finished, or never
    /// having started, or having been abandoned because it was addressed to a channel we drop).
    in_progress: bool,
}

impl Reassembler {
    /// Creates a fresh reassembler with no message in progress.
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_SDU_LEN],
            want: 0,
            have: 0,
            in_progress: false,
        }
    }

    /// Resets any partial reassembly, eg. after a disconnect.
    pub fn reset(&mut self) {
        self.in_progress = false;
        self.want = 0;
        self.have = 0;
    }

    /// Processes the first (or only) fragment of an L2CAP message.
    ///
    /// Returns the complete, reassembled SDU once every fragment has arrived. Returns `Ok(None)`
    /// both when more fragments are still expected and when the message was addressed to a
    /// channel this stack ignores.
    pub fn process_start(&mut self, message: &[u8]) -> Result<Option<&[u8]>, Error> {
        self.in_progress = false;

        let mut reader = ByteReader::new(message);
        let header = Header::from_bytes(&mut reader)?;
        let payload = reader.read_rest();

        if header.channel != ATT_CID {
            trace!("l2cap: dropping message for unsupported channel {:#06x}", header.channel);
            return Ok(None);
        }

        let want = usize::from(header.length);
        if want > MAX_SDU_LEN || payload.len() > want {
            return Err(Error::InvalidLength);
        }

        self.buf[..payload.len()].copy_from_slice(payload);
        self.have = payload.len();
        self.want = want;

        if self.have == self.want {
            Ok(Some(&self.buf[..self.want]))
        } else {
            self.in_progress = true;
            Ok(None)
        }
    }

    /// Processes a continuation fragment of an L2CAP message started by a prior call to
    /// `process_start`.
    ///
    /// Returns the complete, reassembled SDU once every fragment has arrived.
    pub fn process_cont(&mut self, message: &[u8]) -> Result<Option<&[u8]>, Error> {
        if !self.in_progress {
            // A continuation fragment with nothing to continue. This can legitimately happen if
            // the start fragment was for a channel we ignore; stay quiet and keep waiting.
            return Ok(None);
        }

        let remaining = self.want - self.have;
        if message.len() > remaining {
            self.in_progress = false;
            return Err(Error::InvalidLength);
        }

        self.buf[self.have..self.have + message.len()].copy_from_slice(message);
        self.have += message.len();

        if self.have == self.want {
            self.in_progress = false;
            Ok(Some(&self.buf[..self.want]))
        } else {
            Ok(None)
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes `sdu` to the ATT channel, splitting it across as many LL data PDUs as necessary.
///
/// The first PDU carries the 4-byte L2CAP header (SDU length + channel ID); every following PDU
/// carries only payload bytes, up to `MIN_DATA_PAYLOAD_BUF` at a time.
pub fn send_sdu<P: Producer>(tx: &mut P, sdu: &[u8]) -> Result<(), Error> {
    if sdu.len() > MAX_SDU_LEN {
        return Err(Error::InvalidLength);
    }

    let header = Header {
        length: sdu.len() as u16,
        channel: ATT_CID,
    };

    let first_chunk = (MIN_DATA_PAYLOAD_BUF - HEADER_LEN).min(sdu.len());
    let (first, rest) = sdu.split_at(first_chunk);

    tx.produce_with(
        (HEADER_LEN + first.len()) as u8,
        |writer| -> Result<Llid, Error> {
            header.to_bytes(writer)?;
            writer.write_slice(first)?;
            Ok(Llid::DataStart)
        },
    )?;

    for chunk in rest.chunks(MIN_DATA_PAYLOAD_BUF) {
        tx.produce_with(chunk.len() as u8, |writer| -> Result<Llid, Error> {
            writer.write_slice(chunk)?;
            Ok(Llid::DataCont)
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::queue::{PacketQueue, SimpleQueue};

    #[test]
    fn roundtrip_single_fragment() {
        let mut queue = SimpleQueue::new();
        let (mut p, mut c) = (&mut queue).split();

        let sdu = [1, 2, 3, 4, 5];
        send_sdu(&mut p, &sdu).unwrap();

        let mut reasm = Reassembler::new();
        let mut out = None;
        c.consume_pdu_with(|_, pdu| match pdu {
            crate::link::data::Pdu::DataStart { message } => {
                out = reasm.process_start(message).unwrap().map(|s| {
                    let mut v = [0u8; MAX_SDU_LEN];
                    v[..s.len()].copy_from_slice(s);
                    (v, s.len())
                });
                crate::link::queue::Consume::always(Ok(()))
            }
            _ => panic!("expected DataStart"),
        })
        .unwrap();

        let (buf, len) = out.expect("message should have reassembled immediately");
        assert_eq!(&buf[..len], &sdu[..]);
    }

    #[test]
    fn reassembles_across_multiple_fragments() {
        // A payload bigger than one LL data PDU's free space forces fragmentation.
        let sdu: [u8; 60] = {
            let mut buf = [0u8; 60];
            for (i, b) in buf.iter_mut().enumerate() {
                *b = i as u8;
            }
            buf
        };

        let mut reasm = Reassembler::new();

        let header = Header {
            length: sdu.len() as u16,
            channel: ATT_CID,
        };
        let first_chunk = MIN_DATA_PAYLOAD_BUF - HEADER_LEN;
        let mut first_msg = [0u8; MIN_DATA_PAYLOAD_BUF];
        {
            let mut writer = ByteWriter::new(&mut first_msg);
            header.to_bytes(&mut writer).unwrap();
            writer.write_slice(&sdu[..first_chunk]).unwrap();
        }

        assert!(reasm.process_start(&first_msg).unwrap().is_none());

        let mut reassembled = None;
        let mut offset = first_chunk;
        for chunk in sdu[first_chunk..].chunks(MIN_DATA_PAYLOAD_BUF) {
            let result = reasm.process_cont(chunk).unwrap();
            offset += chunk.len();
            if offset == sdu.len() {
                reassembled = result;
            } else {
                assert!(result.is_none());
            }
        }

        assert_eq!(reassembled.expect("should be complete"), &sdu[..]);
    }
}
