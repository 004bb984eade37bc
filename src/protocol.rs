use crate::error::TesiraError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Phrase in the banner the device prints once a TTP session is ready
pub const WELCOME_BANNER: &str = "Welcome to the Tesira Text Protocol Server";

/// First command of every session, switches responses to the structured form
pub const VERBOSE_COMMAND: &str = "SESSION set verbose true";

/// Line written before closing the session on shutdown
pub const TERMINATION_LINE: &str = "exit";

/// Pseudo instance tag for device-wide commands
pub const DEVICE_TAG: &str = "DEVICE";

/// Pseudo instance tag for session commands
pub const SESSION_TAG: &str = "SESSION";

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $text:literal,)+ }
        error = $err:ident;
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            /// Every variant, in declaration order
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            /// Wire spelling (lower camel case)
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = TesiraError;

            /// Case-insensitive parse of the wire spelling
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str().eq_ignore_ascii_case(s))
                    .ok_or_else(|| TesiraError::$err(s.to_string()))
            }
        }
    };
}

wire_enum! {
    /// TTP command verbs
    pub enum Verb {
        Get => "get",
        Set => "set",
        Increment => "increment",
        Decrement => "decrement",
        Toggle => "toggle",
        Subscribe => "subscribe",
        Unsubscribe => "unsubscribe",
        Dial => "dial",
        OnHook => "onHook",
        OffHook => "offHook",
        End => "end",
        Answer => "answer",
        RecallPreset => "recallPreset",
        RecallPresetByName => "recallPresetByName",
    }
    error = UnknownCommand;
}

wire_enum! {
    /// Attribute codes of blocks and channels
    pub enum AttributeCode {
        Verbose => "verbose",
        Aliases => "aliases",
        Ganged => "ganged",
        Label => "label",
        Level => "level",
        Levels => "levels",
        MaxLevel => "maxLevel",
        MinLevel => "minLevel",
        Mute => "mute",
        Mutes => "mutes",
        NumChannels => "numChannels",
        RampInterval => "rampInterval",
        RampStep => "rampStep",
        UseRamping => "useRamping",
        NetworkStatus => "networkStatus",
        CallState => "callState",
        DisplayNameLabel => "displayNameLabel",
        LineLabel => "lineLabel",
        State => "state",
        NumInputs => "numInputs",
        NumOutputs => "numOutputs",
        NumSources => "numSources",
        SourceSelection => "sourceSelection",
        StereoEnable => "stereoEnable",
        Gain => "gain",
        ChannelName => "channelName",
    }
    error = UnknownAttribute;
}

/// Publish token used when subscribing `attribute` on `instance_tag`
///
/// Pure function of its inputs, so notifications can be routed back to the
/// subscribing block after any number of reconnects.
pub fn publish_token(instance_tag: &str, attribute: AttributeCode) -> String {
    format!("{}_{}", instance_tag, attribute.as_str())
}

/// A positional argument of an outgoing command
#[derive(Debug, Clone, PartialEq)]
pub enum CommandValue {
    /// Channel or selection index
    Index(u32),
    /// Integer literal
    Int(i64),
    /// Level in dB, always written with one decimal place
    Level(f64),
    /// Boolean literal
    Bool(bool),
    /// String literal, always quoted
    Text(String),
}

impl fmt::Display for CommandValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandValue::Index(i) => write!(f, "{}", i),
            CommandValue::Int(i) => write!(f, "{}", i),
            CommandValue::Level(l) => write!(f, "{:.1}", l),
            CommandValue::Bool(b) => write!(f, "{}", b),
            CommandValue::Text(s) => f.write_str(&quote(s)),
        }
    }
}

/// Builder for one outgoing TTP command line
///
/// `<instanceTag> <verb> [<attributeCode>] [<arg> ...]`
#[derive(Debug, Clone, PartialEq)]
pub struct CommandLine {
    pub instance_tag: String,
    pub verb: Verb,
    pub attribute: Option<AttributeCode>,
    pub args: Vec<CommandValue>,
}

impl CommandLine {
    /// Create a command with no attribute or arguments
    pub fn new(instance_tag: impl Into<String>, verb: Verb) -> Self {
        Self {
            instance_tag: instance_tag.into(),
            verb,
            attribute: None,
            args: Vec::new(),
        }
    }

    /// `<tag> get <attribute>`
    pub fn get(instance_tag: impl Into<String>, attribute: AttributeCode) -> Self {
        Self::new(instance_tag, Verb::Get).with_attribute(attribute)
    }

    /// `<tag> set <attribute>`
    pub fn set(instance_tag: impl Into<String>, attribute: AttributeCode) -> Self {
        Self::new(instance_tag, Verb::Set).with_attribute(attribute)
    }

    /// Set the attribute code
    pub fn with_attribute(mut self, attribute: AttributeCode) -> Self {
        self.attribute = Some(attribute);
        self
    }

    /// Append a channel index
    pub fn with_index(mut self, index: u32) -> Self {
        self.args.push(CommandValue::Index(index));
        self
    }

    /// Append a value argument
    pub fn with_value(mut self, value: CommandValue) -> Self {
        self.args.push(value);
        self
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", format_tag(&self.instance_tag), self.verb)?;
        if let Some(attribute) = self.attribute {
            write!(f, " {}", attribute)?;
        }
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A command line split back into its parts
///
/// Built from the echoed command a response belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    /// The exact line as sent and echoed
    pub line: String,
    pub instance_tag: String,
    /// `None` when the verb token was missing or unknown
    pub verb: Option<Verb>,
    /// `None` when absent, unknown, or the verb takes no attribute
    pub attribute: Option<AttributeCode>,
    /// Remaining positional tokens (channel indices, literal values)
    pub args: Vec<String>,
}

impl ParsedCommand {
    /// Tokenize a command line
    ///
    /// Unknown verbs or attribute codes are logged and left as `None`, the
    /// tokens are then kept in `args`.
    pub fn parse(line: &str) -> Self {
        let mut tokens = tokenize(line).into_iter();
        let instance_tag = tokens.next().unwrap_or_default();

        let verb = tokens.next().and_then(|word| match word.parse::<Verb>() {
            Ok(verb) => Some(verb),
            Err(e) => {
                tracing::warn!("Could not parse command from \"{}\": {}", line, e);
                None
            }
        });

        let mut args: Vec<String> = tokens.collect();
        let mut attribute = None;
        let takes_attribute = verb.is_some_and(|v| !matches!(v, Verb::RecallPreset | Verb::RecallPresetByName));
        if takes_attribute && !args.is_empty() {
            match args[0].parse::<AttributeCode>() {
                Ok(code) => {
                    attribute = Some(code);
                    args.remove(0);
                }
                Err(e) => {
                    tracing::warn!("Could not parse attribute code from \"{}\": {}", line, e);
                }
            }
        }

        Self {
            line: line.to_string(),
            instance_tag,
            verb,
            attribute,
            args,
        }
    }

    /// First extra token as a channel index, if it is numeric
    pub fn index(&self) -> Option<u32> {
        self.args.first().and_then(|a| a.parse().ok())
    }

    /// True for `get` commands that address the block rather than a channel
    pub fn is_block_get(&self) -> bool {
        self.verb == Some(Verb::Get) && self.args.is_empty()
    }
}

impl fmt::Display for ParsedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

/// Split a line on whitespace, keeping double-quoted substrings together
///
/// Quotes are removed and `\"` / `\\` escapes are undone.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            break;
        };

        let mut token = String::new();
        if first == '"' {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            token.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => token.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }

    tokens
}

/// Double-quote a string literal, escaping quotes and backslashes
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn format_tag(tag: &str) -> String {
    if tag.is_empty() || tag.chars().any(|c| c.is_whitespace() || c == '"') {
        quote(tag)
    } else {
        tag.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_levels_with_one_decimal() {
        let line = CommandLine::set("Level1", AttributeCode::Level)
            .with_index(2)
            .with_value(CommandValue::Level(-12.24))
            .to_string();
        assert_eq!(line, "Level1 set level 2 -12.2");

        let line = CommandLine::set("Level1", AttributeCode::Level)
            .with_index(1)
            .with_value(CommandValue::Level(0.0))
            .to_string();
        assert_eq!(line, "Level1 set level 1 0.0");
    }

    #[test]
    fn formats_bools_and_strings() {
        let line = CommandLine::set("Mute1", AttributeCode::Mute)
            .with_index(3)
            .with_value(CommandValue::Bool(true))
            .to_string();
        assert_eq!(line, "Mute1 set mute 3 true");

        let line = CommandLine::set("Level1", AttributeCode::Label)
            .with_index(1)
            .with_value(CommandValue::Text("Mic 1".into()))
            .to_string();
        assert_eq!(line, "Level1 set label 1 \"Mic 1\"");
    }

    #[test]
    fn quotes_instance_tags_with_spaces() {
        let line = CommandLine::get("Room A Level", AttributeCode::NumChannels).to_string();
        assert_eq!(line, "\"Room A Level\" get numChannels");
        let parsed = ParsedCommand::parse(&line);
        assert_eq!(parsed.instance_tag, "Room A Level");
        assert_eq!(parsed.attribute, Some(AttributeCode::NumChannels));
    }

    #[test]
    fn format_then_parse_recovers_the_command() {
        let cases = vec![
            CommandLine::get("X", AttributeCode::Level).with_index(1),
            CommandLine::set("Lvl", AttributeCode::Level)
                .with_index(4)
                .with_value(CommandValue::Level(-10.5)),
            CommandLine::set("Mutes", AttributeCode::Mute)
                .with_index(2)
                .with_value(CommandValue::Bool(false)),
            CommandLine::set("Logic 1", AttributeCode::Label)
                .with_index(1)
                .with_value(CommandValue::Text("say \"hi\"".into())),
            CommandLine::new("SrcSel", Verb::Subscribe)
                .with_attribute(AttributeCode::SourceSelection)
                .with_value(CommandValue::Text("SrcSel_sourceSelection".into()))
                .with_value(CommandValue::Int(200)),
            CommandLine::get("DEVICE", AttributeCode::NetworkStatus),
        ];

        for cmd in cases {
            let line = cmd.to_string();
            let parsed = ParsedCommand::parse(&line);
            assert_eq!(parsed.instance_tag, cmd.instance_tag, "{}", line);
            assert_eq!(parsed.verb, Some(cmd.verb), "{}", line);
            assert_eq!(parsed.attribute, cmd.attribute, "{}", line);

            let expected: Vec<String> = cmd
                .args
                .iter()
                .map(|a| match a {
                    CommandValue::Text(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            assert_eq!(parsed.args, expected, "{}", line);
        }
    }

    #[test]
    fn parses_verbs_and_attributes_case_insensitively() {
        let parsed = ParsedCommand::parse("Level1 GET NUMCHANNELS");
        assert_eq!(parsed.verb, Some(Verb::Get));
        assert_eq!(parsed.attribute, Some(AttributeCode::NumChannels));
        assert!(parsed.is_block_get());
    }

    #[test]
    fn recall_preset_by_name_keeps_name_as_argument() {
        let parsed = ParsedCommand::parse("DEVICE recallPresetByName \"Level\"");
        assert_eq!(parsed.verb, Some(Verb::RecallPresetByName));
        assert_eq!(parsed.attribute, None);
        assert_eq!(parsed.args, vec!["Level".to_string()]);
    }

    #[test]
    fn unknown_verb_is_left_empty() {
        let parsed = ParsedCommand::parse("Level1 frobnicate level 1");
        assert_eq!(parsed.instance_tag, "Level1");
        assert_eq!(parsed.verb, None);
        assert_eq!(parsed.attribute, None);
        assert_eq!(parsed.args, vec!["level".to_string(), "1".to_string()]);
    }

    #[test]
    fn channel_index_comes_from_first_argument() {
        let parsed = ParsedCommand::parse("Level1 get level 3");
        assert_eq!(parsed.index(), Some(3));
        assert!(!parsed.is_block_get());
        assert_eq!(ParsedCommand::parse("Level1 get ganged").index(), None);
    }

    #[test]
    fn publish_tokens_are_deterministic_and_distinct() {
        let a = publish_token("Level1", AttributeCode::Levels);
        let b = publish_token("Level1", AttributeCode::Levels);
        let c = publish_token("Level1", AttributeCode::Mutes);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, "Level1_levels");

        let tokens: std::collections::HashSet<String> = AttributeCode::ALL
            .iter()
            .map(|code| publish_token("Level1", *code))
            .collect();
        assert_eq!(tokens.len(), AttributeCode::ALL.len());
    }

    #[test]
    fn tokenizer_handles_escapes_and_extra_whitespace() {
        let tokens = tokenize("  a   \"b c\"  \"d \\\"e\\\"\" f ");
        assert_eq!(tokens, vec!["a", "b c", "d \"e\"", "f"]);
    }
}
