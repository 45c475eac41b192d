//! Live session layer: per-connection orchestration and per-provider lanes.

pub mod attribution;
pub mod backlog;
pub mod manager;
pub mod provider_session;
pub mod replay;
pub mod voice;

pub use attribution::{Attribution, AttributionQueue};
pub use backlog::{Admission, BacklogGovernor};
pub use manager::{SessionContext, SessionMode, SessionPhase, StreamSession};
pub use provider_session::{ProviderKey, ProviderSession, PublishResult, SessionEvent};
pub use replay::{ReplaySession, ReplaySessionStore};
pub use voice::{AssistantReply, AssistantVoice, EchoAssistant, MicDecision, VoiceGate};
