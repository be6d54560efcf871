//! Extracted to a separate module to limit the scope of rust-analyzer's
//! work on the requester extension, which is otherwise very slow.

use easy_ext::ext;
use teloxide::prelude::*;
use teloxide::requests::Requester;
use teloxide::types::Message;
use teloxide::utils::markdown;

/// There is [`RequesterExt`] in [`teloxide::prelude`]. We name this symbol
/// different to avoid collisions.
#[ext(UtilRequesterExt)]
pub(crate) impl<T: Requester> T {
    /// Reply to the message. The text is expected to be valid MarkdownV2.
    fn reply_md(&self, msg: &Message, text: impl Into<String>) -> Self::SendMessage {
        self.send_message(msg.chat.id, text)
            .reply_to_message_id(msg.id)
            .allow_sending_without_reply(true)
    }

    /// Same as [`Self::reply_md`], but escapes the text for MarkdownV2.
    fn reply_plain(&self, msg: &Message, text: &str) -> Self::SendMessage {
        self.reply_md(msg, markdown::escape(text))
    }
}
