//! Rust analyzer is very slow on processing requester extension here, so extracted
//! it to a separate module to limit the scope of analysis.

use easy_ext::ext;
use teloxide::payloads::SendMessageSetters;
use teloxide::requests::Requester;
use teloxide::types::{Message, ReplyParameters};
use teloxide::utils::markdown;

/// There is [`teloxide::prelude::RequesterExt`]. We name this symbol
/// different to avoid collisions.
#[ext(UtilRequesterExt)]
pub(crate) impl<T: Requester> T {
    /// Reply to the message. The reply is still sent if the original message
    /// was deleted in the meantime.
    fn reply_to(&self, msg: &Message, text: impl Into<String>) -> Self::SendMessage {
        self.send_message(msg.chat.id, text)
            .reply_parameters(ReplyParameters::new(msg.id).allow_sending_without_reply())
    }

    fn reply_help_md_escaped<Cmd: teloxide::utils::command::BotCommands>(
        &self,
        msg: &Message,
    ) -> Self::SendMessage {
        self.reply_to(msg, markdown::escape(&Cmd::descriptions().to_string()))
    }
}
