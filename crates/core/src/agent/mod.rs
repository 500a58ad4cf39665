pub mod bus;
pub mod host;
pub mod manager;
pub mod provider;
pub mod session;
mod tools;

pub use bus::{BROADCAST_ID, BusMessage, MessageBus};
pub use host::{AgentHost, HostError, ReadyState};
pub use manager::{ManagerError, ManagerHooks, SpawnConfig, SubagentInfo, SubagentManager};
pub use provider::{
  FakeProvider, HistoryEntry, Provider, ProviderError, SessionEvent, Tool, ToolSpec, TurnContext,
};
pub use session::{AgentSession, MAIN_SESSION_ID, PromptOutcome, SessionEnvelope, SessionStatus};
