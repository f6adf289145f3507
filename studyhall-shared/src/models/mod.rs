//! Wire models shared between the server and its clients.

pub mod chat;
pub mod events;
pub mod message;
pub mod timestamp;

pub use chat::{
    ChangeRoleRequest, ChatKind, ChatSummary, CreateGroupChatRequest,
    InviteRequest, MembershipResponse, OpenDirectChatRequest, ParticipantRole, ParticipantView,
    RemoveParticipantRequest, TransferAdminRequest,
};
pub use events::{
    ChatStreamEvent, ConnectedPayload, PresenceStatus, PresenceUpdate, ReactionUpdate,
    TypingUpdate,
};
pub use message::{
    Attachment, EditMessageRequest, MessagePage, MessageType, MessageView, PollResponse,
    ReactionRequest, ReactionView, SendMessageRequest,
};
pub use timestamp::Timestamp;
