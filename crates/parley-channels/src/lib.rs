pub mod telegram;
mod terminal;

pub use telegram::{TelegramApi, TelegramUpdates};
pub use terminal::{TerminalHandle, TerminalInbound, TerminalOutput, TerminalTransport, terminal_pair};
