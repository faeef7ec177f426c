use std::sync::Arc;

use tracing::{error, trace};

use crate::identity::{Identity, Signer};
use crate::packet::{Packet, PacketFlags};
use crate::transport::Transport;

/// Serializes outgoing packets, signs the classes that require a signature, and hands
///  them to the underlying message transport. Non-blocking from the protocol's point
///  of view: the transport either accepts the message or reports failure immediately.
pub struct PacketQueue {
    transport: Arc<dyn Transport>,
    signer: Arc<dyn Signer>,
}

impl PacketQueue {
    /// packet classes that always travel signed
    const SIGNED_CLASSES: PacketFlags = PacketFlags::SYNCHRONIZE
        .union(PacketFlags::CLOSE)
        .union(PacketFlags::RESET);

    pub fn new(transport: Arc<dyn Transport>, signer: Arc<dyn Signer>) -> PacketQueue {
        PacketQueue { transport, signer }
    }

    pub fn signer(&self) -> &dyn Signer {
        self.signer.as_ref()
    }

    pub fn local_identity(&self) -> Identity {
        self.signer.local_identity()
    }

    /// Sign (when required), serialize and send. Returns `false` when the transport
    ///  could not accept the message - the caller treats that as fatal for the
    ///  connection; there is no retry at this layer.
    pub async fn enqueue(
        &self,
        to: &Identity,
        packet: &mut Packet,
        local_port: u16,
        remote_port: u16,
    ) -> bool {
        if (packet.flags().intersects(Self::SIGNED_CLASSES)
            || packet.is_flag_set(PacketFlags::SIGNATURE_INCLUDED))
            && packet.option_signature().is_none()
        {
            if let Err(e) = packet.sign(self.signer.as_ref()) {
                error!("cannot sign outbound packet {}: {}", packet, e);
                return false;
            }
        }

        let buf = match packet.encode() {
            Ok(buf) => buf,
            Err(e) => {
                error!("cannot serialize outbound packet {}: {}", packet, e);
                return false;
            }
        };

        trace!("sending packet {} to {} ({} bytes)", packet, to, buf.len());
        let delivered = self.transport.send(to, &buf, local_port, remote_port).await;
        if !delivered {
            error!("transport refused packet {} to {}", packet, to);
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{MockSigner, Signature};
    use crate::packet::StreamId;
    use crate::transport::MockTransport;
    use rstest::rstest;

    fn queue_with(transport: MockTransport, signer: MockSigner) -> PacketQueue {
        PacketQueue::new(Arc::new(transport), Arc::new(signer))
    }

    fn peer() -> Identity {
        Identity::from_bytes(vec![7; 4])
    }

    #[rstest]
    fn test_plain_ack_is_sent_unsigned() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut transport = MockTransport::new();
            transport
                .expect_send()
                .withf(|_, payload, lp, rp| {
                    let decoded = Packet::decode(payload).unwrap();
                    !decoded.is_flag_set(PacketFlags::SIGNATURE_INCLUDED) && *lp == 1 && *rp == 2
                })
                .once()
                .return_const(true);
            let signer = MockSigner::new(); // sign() must never be called

            let queue = queue_with(transport, signer);
            let mut packet = Packet::new(StreamId::from_raw(5), StreamId::from_raw(6), 0);
            assert!(queue.enqueue(&peer(), &mut packet, 1, 2).await);
        });
    }

    #[rstest]
    #[case::syn(PacketFlags::SYNCHRONIZE)]
    #[case::close(PacketFlags::CLOSE)]
    #[case::reset(PacketFlags::RESET)]
    fn test_signed_classes_get_signed(#[case] flag: PacketFlags) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut signer = MockSigner::new();
            signer.expect_sign().once().returning(|_| Signature([0xee; Signature::LEN]));

            let mut transport = MockTransport::new();
            transport
                .expect_send()
                .withf(|_, payload, _, _| {
                    let decoded = Packet::decode(payload).unwrap();
                    decoded.option_signature() == Some(&Signature([0xee; Signature::LEN]))
                })
                .once()
                .return_const(true);

            let queue = queue_with(transport, signer);
            let mut packet = Packet::new(StreamId::from_raw(5), StreamId::from_raw(6), 1);
            packet.set_flag(flag);
            assert!(queue.enqueue(&peer(), &mut packet, 0, 0).await);
        });
    }

    #[rstest]
    fn test_transport_refusal_is_reported() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut transport = MockTransport::new();
            transport.expect_send().return_const(false);

            let queue = queue_with(transport, MockSigner::new());
            let mut packet = Packet::new(StreamId::from_raw(5), StreamId::from_raw(6), 0);
            assert!(!queue.enqueue(&peer(), &mut packet, 0, 0).await);
        });
    }
}
