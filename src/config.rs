use anyhow::bail;
use std::time::Duration;

/// Coarse classification of a channel's role, which picks its buffering limits: `Internal`
///  channels carry the application's own control traffic and get generous buffers,
///  `External` channels talk to untrusted peers and are kept on a short leash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Internal,
    External,
}

/// What to do when a channel's send window is full beyond its overflow allowance and the
///  application keeps sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// resend the oldest outstanding packet and keep buffering - prioritizes throughput
    ForceFlush,
    /// refuse the new message - prioritizes bounded memory, pushes back on the caller
    Reject,
}

/// Per-channel behavior switches, fixed at channel creation.
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub kind: ChannelKind,
    /// a *regular* side flushes and acks on a schedule; an irregular side acks immediately
    ///  because nobody will do it for it later
    pub locally_regular: bool,
    /// whether the peer flushes on a schedule - governs how eagerly we resend into holes
    pub peer_regular: bool,
    /// adopt the source address of the first incoming packet as the peer address
    pub auto_switch_to_first_sender: bool,
}

impl ChannelOptions {
    pub fn regular(kind: ChannelKind) -> ChannelOptions {
        ChannelOptions {
            kind,
            locally_regular: true,
            peer_regular: true,
            auto_switch_to_first_sender: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// hard upper bound for an encoded packet, headers included; must fit the path MTU
    pub max_packet_len: usize,
    pub send_window_size: usize,
    pub receive_window_size: usize,

    /// extra send-window slots tolerated beyond the nominal size, per channel kind
    pub max_overflow_internal: usize,
    pub max_overflow_external: usize,
    /// indexed channels multiplex on one peer - keep each one's overflow small
    pub max_overflow_indexed: usize,
    pub overflow_policy: OverflowPolicy,
    /// overflow beyond this is a broken peer - the channel is condemned
    pub hard_overflow_ceiling: usize,

    pub initial_rtt: Duration,
    /// EMA weight of a new RTT sample
    pub rtt_smoothing: f64,
    /// resend after this multiple of the smoothed RTT without an ack
    pub resend_rtt_multiplier: f64,
    pub min_resend_delay: Duration,

    /// tear a channel down after this long without hearing from the peer; `None` keeps
    ///  channels forever
    pub channel_inactivity_timeout: Option<Duration>,

    /// longest accepted fragment chain, in packets
    pub max_fragment_chain_packets: usize,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            max_packet_len: 1400,
            send_window_size: 1024,
            receive_window_size: 1024,
            max_overflow_internal: 64,
            max_overflow_external: 16,
            max_overflow_indexed: 16,
            overflow_policy: OverflowPolicy::ForceFlush,
            hard_overflow_ceiling: 256,
            initial_rtt: Duration::from_millis(50),
            rtt_smoothing: 0.1,
            resend_rtt_multiplier: 1.5,
            min_resend_delay: Duration::from_millis(20),
            channel_inactivity_timeout: Some(Duration::from_secs(30)),
            max_fragment_chain_packets: 1024,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        // biggest possible header plus room for at least a minimal message
        if self.max_packet_len < 256 {
            bail!("max_packet_len of {} is too small to be useful", self.max_packet_len);
        }
        if self.max_packet_len > 65507 {
            bail!("max_packet_len of {} exceeds what UDP can carry", self.max_packet_len);
        }
        if self.send_window_size == 0 || self.receive_window_size == 0 {
            bail!("window sizes must be positive");
        }
        if self.receive_window_size > 4096 {
            // the selective ack list must stay within what the wire format accepts
            bail!("receive_window_size of {} exceeds the selective ack limit", self.receive_window_size);
        }
        if !(0.0..=1.0).contains(&self.rtt_smoothing) || self.rtt_smoothing == 0.0 {
            bail!("rtt_smoothing must be in (0, 1], got {}", self.rtt_smoothing);
        }
        if self.resend_rtt_multiplier < 1.0 {
            bail!("resend_rtt_multiplier must be at least 1.0, got {}", self.resend_rtt_multiplier);
        }
        if self.max_fragment_chain_packets == 0 {
            bail!("max_fragment_chain_packets must be positive");
        }
        Ok(())
    }

    pub fn max_overflow(&self, kind: ChannelKind, is_indexed: bool) -> usize {
        if is_indexed {
            return self.max_overflow_indexed;
        }
        match kind {
            ChannelKind::Internal => self.max_overflow_internal,
            ChannelKind::External => self.max_overflow_external,
        }
    }

    /// how long to wait for an ack before resending, given the current RTT estimate
    pub fn resend_delay(&self, rtt: Duration) -> Duration {
        rtt.mul_f64(self.resend_rtt_multiplier).max(self.min_resend_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_default_config_is_valid() {
        assert!(TransportConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::tiny_packet(TransportConfig { max_packet_len: 10, ..Default::default() })]
    #[case::oversized_packet(TransportConfig { max_packet_len: 100_000, ..Default::default() })]
    #[case::zero_window(TransportConfig { send_window_size: 0, ..Default::default() })]
    #[case::huge_receive_window(TransportConfig { receive_window_size: 100_000, ..Default::default() })]
    #[case::zero_smoothing(TransportConfig { rtt_smoothing: 0.0, ..Default::default() })]
    #[case::small_multiplier(TransportConfig { resend_rtt_multiplier: 0.5, ..Default::default() })]
    fn test_invalid_config_is_rejected(#[case] config: TransportConfig) {
        assert!(config.validate().is_err());
    }

    #[rstest]
    fn test_resend_delay_floors_at_minimum() {
        let config = TransportConfig::default();
        assert_eq!(config.resend_delay(Duration::from_millis(1)), Duration::from_millis(20));
        assert_eq!(config.resend_delay(Duration::from_millis(100)), Duration::from_millis(150));
    }

    #[rstest]
    fn test_overflow_limits_by_kind() {
        let config = TransportConfig::default();
        assert_eq!(config.max_overflow(ChannelKind::Internal, false), 64);
        assert_eq!(config.max_overflow(ChannelKind::External, false), 16);
        assert_eq!(config.max_overflow(ChannelKind::Internal, true), 16);
    }
}
