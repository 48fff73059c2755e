/// 健康监测
///
/// 被动方向：内部 feature/RTP server 的心跳跟踪；主动方向：对外部网关的 OPTIONS 探测
mod heartbeat;
mod prober;

pub use heartbeat::{
    HealthMonitor, HealthSettings, Heartbeat, HeartbeatReply, ServerKind, FS_STATUS_HEADER,
    MEMBERS_HEADER, RTP_STATUS_HEADER,
};
pub use prober::{OptionsProber, ProbeTarget, ProberSettings};
