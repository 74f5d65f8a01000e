mod mailbox;

pub use mailbox::{MailboxReceiver, MailboxSender, RecvError, SendError, TryRecvError, mailbox};
