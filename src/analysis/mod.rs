//! Token analysis: ranking, admission, the oracle session and the urgent
//! gateway.

pub mod gateway;
pub mod oracle;
pub mod priority_queue;
pub mod scheduler;
pub mod transport;

pub use gateway::{submit_urgent, UrgentGateway};
pub use oracle::{
    classify_reply, AnalysisOutcome, AnalysisTicket, OracleReply, OracleSession, OracleTransport,
    PendingAnalysisRequest, ReplyKind,
};
pub use priority_queue::PriorityTokenQueue;
pub use scheduler::{admission_threshold, Admission, AnalysisScheduler, Candidate};
pub use transport::WsOracleTransport;
