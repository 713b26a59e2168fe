pub mod contact;
pub mod conversation;
pub mod facebook_channel;
pub mod inbox;
pub mod message;
pub mod user;
pub mod workspace;

pub use contact::Contact;
pub use conversation::{Conversation, ConversationStatus, ParseStatusError};
pub use facebook_channel::FacebookChannel;
pub use inbox::{ChannelType, Inbox};
pub use message::{Attachment, ContentType, Message, SenderType};
pub use user::{Session, User};
pub use workspace::{Workspace, WorkspaceRole, WorkspaceUser};
