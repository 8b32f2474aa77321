use crate::routing::RoutingResult;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProtocolError {
    #[error("malformed line: {0}")]
    Malformed(String),
    #[error("invalid escape sequence in {0}")]
    BadEscape(String),
}

/// Engine-module escaping: `%` doubles, `:` and control characters are
/// shifted up by 64 behind a `%`.
pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '%' => out.push_str("%%"),
            c if c == ':' || (c as u32) < 32 => {
                out.push('%');
                out.push(((c as u8) + 64) as char);
            }
            c => out.push(c),
        }
    }
    out
}

pub fn unescape(input: &str) -> Result<String, ProtocolError> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(c) if (c as u32) >= 64 && (c as u32) < 128 => {
                out.push(((c as u8) - 64) as char);
            }
            _ => return Err(ProtocolError::BadEscape(input.to_string())),
        }
    }
    Ok(out)
}

/// One engine message, as carried on a `%%>message` / `%%<message` line.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub time: String,
    pub name: String,
    pub retvalue: String,
    pub params: BTreeMap<String, String>,
}

impl Message {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    /// Encode the answer line for this message.
    pub fn answer(&self, processed: bool) -> String {
        let mut line = format!(
            "%%<message:{}:{}:{}:{}",
            escape(&self.id),
            processed,
            escape(&self.name),
            escape(&self.retvalue)
        );
        for (key, value) in &self.params {
            line.push(':');
            line.push_str(&escape(key));
            line.push('=');
            line.push_str(&escape(value));
        }
        line
    }
}

/// Lines the daemon cares about on the engine channel.
#[derive(Debug, PartialEq)]
pub enum Incoming {
    Message(Message),
    InstallReply { name: String, success: bool },
    Other(String),
}

pub fn parse_line(line: &str) -> Result<Incoming, ProtocolError> {
    if let Some(rest) = line.strip_prefix("%%>message:") {
        let mut fields = rest.splitn(4, ':');
        let id = next_field(&mut fields, line)?;
        let time = next_field(&mut fields, line)?;
        let name = next_field(&mut fields, line)?;
        let tail = fields.next().unwrap_or_default();
        let mut tail_fields = tail.split(':');
        let retvalue = match tail_fields.next() {
            Some(raw) => unescape(raw)?,
            None => String::new(),
        };
        let mut params = BTreeMap::new();
        for word in tail_fields {
            let word = unescape(word)?;
            match word.split_once('=') {
                Some((key, value)) => params.insert(key.to_string(), value.to_string()),
                None => params.insert(word, String::new()),
            };
        }
        return Ok(Incoming::Message(Message {
            id,
            time,
            name,
            retvalue,
            params,
        }));
    }
    if let Some(rest) = line.strip_prefix("%%<install:") {
        let mut fields = rest.split(':');
        let _priority = fields.next();
        let name = match fields.next() {
            Some(raw) => unescape(raw)?,
            None => return Err(ProtocolError::Malformed(line.to_string())),
        };
        let success = fields.next() == Some("true");
        return Ok(Incoming::InstallReply { name, success });
    }
    Ok(Incoming::Other(line.to_string()))
}

fn next_field(fields: &mut std::str::SplitN<'_, char>, line: &str) -> Result<String, ProtocolError> {
    fields
        .next()
        .ok_or_else(|| ProtocolError::Malformed(line.to_string()))
        .and_then(|raw| unescape(raw))
}

/// Handler installation line for a message name at a priority.
pub fn install_line(priority: u32, name: &str) -> String {
    format!("%%>install:{}:{}", priority, escape(name))
}

/// Merge a routing result into the message to answer: the result's global
/// parameters ride on the message itself; forks become `callto.<n>`
/// parameter sets, per-target parameters only where they differ from the
/// global value.
pub fn apply_routing_result(msg: &mut Message, result: &RoutingResult) {
    let global = result.target().params.clone();
    msg.params.extend(global.clone());
    match result {
        RoutingResult::Simple { target } => {
            msg.retvalue = target.target.clone();
        }
        RoutingResult::Fork { fork_targets, .. } => {
            msg.retvalue = "fork".to_string();
            for (i, target) in fork_targets.iter().enumerate() {
                let prefix = format!("callto.{}", i + 1);
                msg.params.insert(prefix.clone(), target.target.clone());
                for (key, value) in &target.params {
                    if global.get(key) != Some(value) {
                        msg.params
                            .insert(format!("{}.{}", prefix, key), value.clone());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::CallTarget;

    #[test]
    fn test_escape_roundtrip() {
        let raw = "sip/sip:2001@dect with 100% uptime\nnext";
        let escaped = escape(raw);
        assert!(!escaped.contains(':'));
        assert!(!escaped.contains('\n'));
        assert_eq!(unescape(&escaped).unwrap(), raw);
        assert_eq!(escape(":"), "%z");
        assert_eq!(unescape("%z").unwrap(), ":");
        assert!(unescape("%5").is_err());
    }

    #[test]
    fn test_parse_message_line() {
        let line = "%%>message:0x7f:1605000000:call.route::caller=4748:called=2000:billid=12-34";
        match parse_line(line).unwrap() {
            Incoming::Message(msg) => {
                assert_eq!(msg.id, "0x7f");
                assert_eq!(msg.name, "call.route");
                assert_eq!(msg.retvalue, "");
                assert_eq!(msg.param("caller"), Some("4748"));
                assert_eq!(msg.param("called"), Some("2000"));
                assert_eq!(msg.param("billid"), Some("12-34"));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_parse_install_reply() {
        assert_eq!(
            parse_line("%%<install:90:call.route:true").unwrap(),
            Incoming::InstallReply {
                name: "call.route".to_string(),
                success: true
            }
        );
    }

    #[test]
    fn test_answer_encoding_escapes_values() {
        let mut msg = Message {
            id: "0x7f".to_string(),
            time: "0".to_string(),
            name: "call.route".to_string(),
            retvalue: "sip/sip:2004@dect".to_string(),
            params: BTreeMap::new(),
        };
        msg.set_param("calledname", "PoC BeF");
        let line = msg.answer(true);
        assert!(line.starts_with("%%<message:0x7f:true:call.route:sip/sip%z2004@dect"));
        assert!(line.ends_with(":calledname=PoC BeF"));
    }

    #[test]
    fn test_apply_fork_result_suppresses_global_params() {
        let mut shared = CallTarget::new("lateroute/stage1-abc-1");
        shared.set("x_eventphone_id", "abc");
        let mut child = CallTarget::new("lateroute/2042");
        child.set("x_eventphone_id", "abc");
        child.set("eventphone_stage2", "1");
        let result = RoutingResult::Fork {
            target: shared,
            fork_targets: vec![child, CallTarget::new("|drop=20")],
        };
        let mut msg = Message {
            id: "1".to_string(),
            time: "0".to_string(),
            name: "call.route".to_string(),
            retvalue: String::new(),
            params: BTreeMap::new(),
        };
        apply_routing_result(&mut msg, &result);
        assert_eq!(msg.retvalue, "fork");
        assert_eq!(msg.param("x_eventphone_id"), Some("abc"));
        assert_eq!(msg.param("callto.1"), Some("lateroute/2042"));
        assert_eq!(msg.param("callto.1.eventphone_stage2"), Some("1"));
        // shared with the global set, so not repeated per target
        assert_eq!(msg.param("callto.1.x_eventphone_id"), None);
        assert_eq!(msg.param("callto.2"), Some("|drop=20"));
    }

    #[test]
    fn test_apply_simple_result() {
        let mut target = CallTarget::new("lateroute/2005");
        target.set("eventphone_stage2", "1");
        let result = RoutingResult::Simple { target };
        let mut msg = Message {
            id: "2".to_string(),
            time: "0".to_string(),
            name: "call.route".to_string(),
            retvalue: String::new(),
            params: BTreeMap::new(),
        };
        apply_routing_result(&mut msg, &result);
        assert_eq!(msg.retvalue, "lateroute/2005");
        assert_eq!(msg.param("eventphone_stage2"), Some("1"));
    }
}
