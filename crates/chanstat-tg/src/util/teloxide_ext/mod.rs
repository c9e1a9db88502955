mod requester;

use easy_ext::ext;
use teloxide::types::{Chat, UpdateKind, User};

pub(crate) mod prelude {
    pub(crate) use super::{
        requester::UtilRequesterExt as _, ChatExt as _, UpdateKindExt as _, UserExt as _,
    };
}

#[ext(UserExt)]
pub(crate) impl User {
    fn username(&self) -> String {
        self.username.clone().unwrap_or_else(|| self.full_name())
    }

    fn debug_id(&self) -> String {
        format!("{} ({})", self.username(), self.id)
    }
}

#[ext(ChatExt)]
pub(crate) impl Chat {
    fn debug_id(&self) -> String {
        let title = self
            .title()
            .or_else(|| self.username())
            .unwrap_or("{unknown_chat_title}");

        format!("{title} ({})", self.id)
    }
}

#[ext(UpdateKindExt)]
pub(crate) impl UpdateKind {
    fn discriminator(&self) -> &'static str {
        match self {
            UpdateKind::Message(_) => "Message",
            UpdateKind::EditedMessage(_) => "EditedMessage",
            UpdateKind::ChannelPost(_) => "ChannelPost",
            UpdateKind::EditedChannelPost(_) => "EditedChannelPost",
            UpdateKind::CallbackQuery(_) => "CallbackQuery",
            UpdateKind::MyChatMember(_) => "MyChatMember",
            UpdateKind::ChatMember(_) => "ChatMember",
            UpdateKind::Error(_) => "Error",
            _ => "Other",
        }
    }
}
