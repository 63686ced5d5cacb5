#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DeliveryGuarantee {
    /// Sent once, in its own packet. May be lost, duplicated or reordered.
    Unreliable,
    /// Retransmitted until acknowledged, delivered exactly once and in order.
    Reliable,
}
