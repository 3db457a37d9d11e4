//! Gateway intents: which event groups the session subscribes to.
//!
//! Each intent is a named boolean; the wire form is a single integer built by
//! [`Intents::bits`] and read back by [`Intents::from_bits`].

const GUILDS: u64 = 1 << 0;
const GUILD_MEMBERS: u64 = 1 << 1;
const GUILD_BANS: u64 = 1 << 2;
const GUILD_EMOJIS: u64 = 1 << 3;
const GUILD_INTEGRATIONS: u64 = 1 << 4;
const GUILD_WEBHOOKS: u64 = 1 << 5;
const GUILD_INVITES: u64 = 1 << 6;
const GUILD_VOICE_STATES: u64 = 1 << 7;
const GUILD_PRESENCES: u64 = 1 << 8;
const GUILD_MESSAGES: u64 = 1 << 9;
const GUILD_MESSAGE_REACTIONS: u64 = 1 << 10;
const GUILD_MESSAGE_TYPING: u64 = 1 << 11;
const DIRECT_MESSAGES: u64 = 1 << 12;
const DIRECT_MESSAGE_REACTIONS: u64 = 1 << 13;
const DIRECT_MESSAGE_TYPING: u64 = 1 << 14;
const MESSAGE_CONTENT: u64 = 1 << 15;

/// Intent set sent with IDENTIFY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intents {
    pub guilds: bool,
    /// Privileged.
    pub guild_members: bool,
    pub guild_bans: bool,
    pub guild_emojis: bool,
    pub guild_integrations: bool,
    pub guild_webhooks: bool,
    pub guild_invites: bool,
    pub guild_voice_states: bool,
    /// Privileged.
    pub guild_presences: bool,
    pub guild_messages: bool,
    pub guild_message_reactions: bool,
    pub guild_message_typing: bool,
    pub direct_messages: bool,
    pub direct_message_reactions: bool,
    pub direct_message_typing: bool,
    /// Privileged.
    pub message_content: bool,
}

impl Intents {
    pub const fn none() -> Self {
        Self::from_bits(0)
    }

    pub const fn all() -> Self {
        Self::from_bits(u64::MAX)
    }

    /// Everything except the privileged intents (members, presences, message content).
    pub const fn non_privileged() -> Self {
        let mut i = Self::all();
        i.guild_members = false;
        i.guild_presences = false;
        i.message_content = false;
        i
    }

    /// Integer form. Unknown bits are never produced.
    pub const fn bits(&self) -> u64 {
        let mut v = 0;
        if self.guilds {
            v |= GUILDS;
        }
        if self.guild_members {
            v |= GUILD_MEMBERS;
        }
        if self.guild_bans {
            v |= GUILD_BANS;
        }
        if self.guild_emojis {
            v |= GUILD_EMOJIS;
        }
        if self.guild_integrations {
            v |= GUILD_INTEGRATIONS;
        }
        if self.guild_webhooks {
            v |= GUILD_WEBHOOKS;
        }
        if self.guild_invites {
            v |= GUILD_INVITES;
        }
        if self.guild_voice_states {
            v |= GUILD_VOICE_STATES;
        }
        if self.guild_presences {
            v |= GUILD_PRESENCES;
        }
        if self.guild_messages {
            v |= GUILD_MESSAGES;
        }
        if self.guild_message_reactions {
            v |= GUILD_MESSAGE_REACTIONS;
        }
        if self.guild_message_typing {
            v |= GUILD_MESSAGE_TYPING;
        }
        if self.direct_messages {
            v |= DIRECT_MESSAGES;
        }
        if self.direct_message_reactions {
            v |= DIRECT_MESSAGE_REACTIONS;
        }
        if self.direct_message_typing {
            v |= DIRECT_MESSAGE_TYPING;
        }
        if self.message_content {
            v |= MESSAGE_CONTENT;
        }
        v
    }

    /// Read an integer; bits without a named intent are dropped.
    pub const fn from_bits(v: u64) -> Self {
        Self {
            guilds: v & GUILDS != 0,
            guild_members: v & GUILD_MEMBERS != 0,
            guild_bans: v & GUILD_BANS != 0,
            guild_emojis: v & GUILD_EMOJIS != 0,
            guild_integrations: v & GUILD_INTEGRATIONS != 0,
            guild_webhooks: v & GUILD_WEBHOOKS != 0,
            guild_invites: v & GUILD_INVITES != 0,
            guild_voice_states: v & GUILD_VOICE_STATES != 0,
            guild_presences: v & GUILD_PRESENCES != 0,
            guild_messages: v & GUILD_MESSAGES != 0,
            guild_message_reactions: v & GUILD_MESSAGE_REACTIONS != 0,
            guild_message_typing: v & GUILD_MESSAGE_TYPING != 0,
            direct_messages: v & DIRECT_MESSAGES != 0,
            direct_message_reactions: v & DIRECT_MESSAGE_REACTIONS != 0,
            direct_message_typing: v & DIRECT_MESSAGE_TYPING != 0,
            message_content: v & MESSAGE_CONTENT != 0,
        }
    }

    /// Guild and direct messages both enabled.
    pub fn messages(&self) -> bool {
        self.guild_messages && self.direct_messages
    }

    pub fn set_messages(&mut self, on: bool) {
        self.guild_messages = on;
        self.direct_messages = on;
    }

    pub fn reactions(&self) -> bool {
        self.guild_message_reactions && self.direct_message_reactions
    }

    pub fn set_reactions(&mut self, on: bool) {
        self.guild_message_reactions = on;
        self.direct_message_reactions = on;
    }

    pub fn typing(&self) -> bool {
        self.guild_message_typing && self.direct_message_typing
    }

    pub fn set_typing(&mut self, on: bool) {
        self.guild_message_typing = on;
        self.direct_message_typing = on;
    }
}

impl Default for Intents {
    fn default() -> Self {
        Self::non_privileged()
    }
}

impl From<u64> for Intents {
    fn from(v: u64) -> Self {
        Self::from_bits(v)
    }
}

impl From<Intents> for u64 {
    fn from(i: Intents) -> Self {
        i.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_covers_every_named_bit() {
        assert_eq!(Intents::all().bits(), (1 << 16) - 1);
        assert_eq!(Intents::none().bits(), 0);
    }

    #[test]
    fn default_excludes_privileged() {
        let d = Intents::default();
        assert!(!d.guild_members);
        assert!(!d.guild_presences);
        assert!(!d.message_content);
        assert!(d.guilds && d.guild_messages && d.direct_messages);
        assert_eq!(d.bits(), 0x7EFD);
    }

    #[test]
    fn from_bits_drops_unknown_bits() {
        let i = Intents::from_bits(GUILDS | GUILD_MESSAGES | (1 << 40));
        assert_eq!(i.bits(), 513);
    }

    #[test]
    fn aliases_toggle_guild_and_dm_pairs() {
        let mut i = Intents::none();
        i.set_messages(true);
        assert_eq!(i.bits(), 4608);
        assert!(i.messages());
        i.set_reactions(true);
        assert_eq!(i.bits(), 4608 | 9216);
        i.set_typing(true);
        assert!(i.typing());
        i.direct_messages = false;
        assert!(!i.messages());
    }
}
