//! Connection-quality sampling.
//!
//! Every five seconds, per peer connection, the sampler reads video packet
//! counters from the stats report and classifies the loss rate into four
//! tiers. The result feeds the UI only; it never drives reconnection.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::protocol::UserId;

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl LinkQuality {
    /// Fixed loss-rate thresholds: <2% excellent, <5% good, <10% fair.
    pub fn from_loss_rate(loss_rate: f64) -> Self {
        if loss_rate < 0.02 {
            LinkQuality::Excellent
        } else if loss_rate < 0.05 {
            LinkQuality::Good
        } else if loss_rate < 0.10 {
            LinkQuality::Fair
        } else {
            LinkQuality::Poor
        }
    }

    /// Classify an interval's packet counters. No traffic reads as excellent
    /// rather than poor; an idle link is not a lossy one.
    pub fn classify(lost: u64, total: u64) -> Self {
        if total == 0 {
            return LinkQuality::Excellent;
        }
        Self::from_loss_rate(lost as f64 / total as f64)
    }
}

/// Raw video packet counters pulled from one stats report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoCounters {
    pub packets_sent: u64,
    pub packets_lost: u64,
}

/// Tracks counter deltas between samples so each classification covers one
/// interval, not the whole session.
#[derive(Debug, Default)]
pub struct QualitySampler {
    prev: VideoCounters,
}

impl QualitySampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, counters: VideoCounters) -> LinkQuality {
        let sent = counters.packets_sent.saturating_sub(self.prev.packets_sent);
        let lost = counters.packets_lost.saturating_sub(self.prev.packets_lost);
        self.prev = counters;
        LinkQuality::classify(lost, sent + lost)
    }
}

/// Video counters for one peer connection. Loss comes from the remote's
/// receiver reports (RTCP), which is the only loss figure webrtc-rs exposes.
pub async fn video_counters(pc: &RTCPeerConnection) -> VideoCounters {
    let report = pc.get_stats().await;
    let mut counters = VideoCounters::default();
    for stat in report.reports.values() {
        if let StatsReportType::OutboundRTP(rtp) = stat {
            if rtp.kind == "video" {
                counters.packets_sent = counters.packets_sent.saturating_add(rtp.packets_sent);
            }
        }
        if let StatsReportType::RemoteInboundRTP(remote) = stat {
            if remote.kind == "video" {
                counters.packets_lost =
                    counters.packets_lost.saturating_add(remote.packets_lost.max(0) as u64);
            }
        }
    }
    counters
}

/// Periodic sampler task for one peer connection. Publishes only on change;
/// stops when the receiver side goes away or the connection is dropped.
pub fn spawn_monitor(
    pc: Arc<RTCPeerConnection>,
    remote_user: UserId,
    updates: mpsc::UnboundedSender<(UserId, LinkQuality)>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(SAMPLE_INTERVAL);
        let mut sampler = QualitySampler::new();
        let mut last = None;
        loop {
            ticker.tick().await;
            let quality = sampler.sample(video_counters(&pc).await);
            if last != Some(quality) {
                last = Some(quality);
                if updates.send((remote_user.clone(), quality)).is_err() {
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_match_the_four_tiers() {
        assert_eq!(LinkQuality::from_loss_rate(0.0), LinkQuality::Excellent);
        assert_eq!(LinkQuality::from_loss_rate(0.019), LinkQuality::Excellent);
        assert_eq!(LinkQuality::from_loss_rate(0.02), LinkQuality::Good);
        assert_eq!(LinkQuality::from_loss_rate(0.049), LinkQuality::Good);
        assert_eq!(LinkQuality::from_loss_rate(0.05), LinkQuality::Fair);
        assert_eq!(LinkQuality::from_loss_rate(0.099), LinkQuality::Fair);
        assert_eq!(LinkQuality::from_loss_rate(0.10), LinkQuality::Poor);
        assert_eq!(LinkQuality::from_loss_rate(1.0), LinkQuality::Poor);
    }

    #[test]
    fn idle_link_is_not_poor() {
        assert_eq!(LinkQuality::classify(0, 0), LinkQuality::Excellent);
    }

    #[test]
    fn sampler_classifies_per_interval_deltas() {
        let mut sampler = QualitySampler::new();
        // First interval: 1000 sent, 10 lost -> ~1% loss.
        assert_eq!(
            sampler.sample(VideoCounters { packets_sent: 1000, packets_lost: 10 }),
            LinkQuality::Excellent
        );
        // Second interval: 100 more sent, 30 more lost -> ~23% loss, even
        // though the cumulative rate is still low.
        assert_eq!(
            sampler.sample(VideoCounters { packets_sent: 1100, packets_lost: 40 }),
            LinkQuality::Poor
        );
        // Third interval: clean again.
        assert_eq!(
            sampler.sample(VideoCounters { packets_sent: 2100, packets_lost: 40 }),
            LinkQuality::Excellent
        );
    }
}
