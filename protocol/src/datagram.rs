use crate::guarantees::DeliveryGuarantee;

/// One record handed to `send`, with the guarantee it should be delivered with.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Datagram<'a> {
    pub(crate) delivery: DeliveryGuarantee,
    pub(crate) payload: &'a [u8],
}

impl<'a> Datagram<'a> {
    pub fn unreliable(payload: &'a [u8]) -> Self {
        Self {
            delivery: DeliveryGuarantee::Unreliable,
            payload,
        }
    }

    pub fn reliable(payload: &'a [u8]) -> Self {
        Self {
            delivery: DeliveryGuarantee::Reliable,
            payload,
        }
    }

    pub fn delivery(&self) -> DeliveryGuarantee {
        self.delivery
    }

    pub fn is_reliable(&self) -> bool {
        self.delivery == DeliveryGuarantee::Reliable
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}

impl<'a> From<&'a [u8]> for Datagram<'a> {
    fn from(payload: &'a [u8]) -> Self {
        Datagram::reliable(payload)
    }
}
