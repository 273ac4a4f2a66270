//! STOMP 1.2 帧模型与文本编解码
//!
//! 帧格式：命令行、若干 `name:value` 头部行、空行、正文、NUL 结束符。
//! 帧与帧之间单独出现的换行是心跳。

use std::time::Duration;

use crate::error::{AppError, Result};

pub const STOMP_VERSIONS: &str = "1.2,1.1,1.0";
pub const HEARTBEAT_EOL: &str = "\n";

/// 单帧（头部 + 正文）允许的最大字节数
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

const NUL: u8 = 0;
const LF: u8 = b'\n';
const CR: u8 = b'\r';

/// STOMP 命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    // 客户端命令
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Disconnect,

    // 服务端命令
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let command = match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "DISCONNECT" => Command::Disconnect,
            "CONNECTED" => Command::Connected,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return None,
        };
        Some(command)
    }

    // CONNECT/CONNECTED 的头部不做转义
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

/// 单个 STOMP 帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// 重复头部以第一次出现的值为准
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// 创建握手帧
    pub fn connect(host: &str, heart_beat: HeartBeat, token: Option<&str>) -> Self {
        let frame = Frame::new(Command::Connect)
            .header("accept-version", STOMP_VERSIONS)
            .header("host", host)
            .header("heart-beat", heart_beat.to_string());

        match token {
            Some(token) => frame.header("Authorization", format!("Bearer {}", token)),
            None => frame,
        }
    }

    /// 创建订阅帧
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    pub fn encode(&self) -> String {
        let escape_headers = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());

        out.push_str(self.command.as_str());
        out.push('\n');

        for (name, value) in &self.headers {
            if escape_headers {
                out.push_str(&escape(name));
                out.push(':');
                out.push_str(&escape(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }

        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }

        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(AppError::Protocol(format!(
                    "invalid header escape sequence: \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

/// 解码结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    HeartBeat,
    Frame(Frame),
}

/// 增量解码器，处理跨消息拆分的帧与帧间心跳
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// 取出下一个完整单元；数据不足时返回 `None`。
    /// 畸形帧会被整帧丢弃（直到下一个 NUL），以保证后续帧可继续解码。
    pub fn next_frame(&mut self) -> Option<Result<Decoded>> {
        if self.buf.is_empty() || self.buf == [CR] {
            return None;
        }
        if self.buf[0] == LF {
            self.buf.drain(..1);
            return Some(Ok(Decoded::HeartBeat));
        }
        if self.buf.starts_with(&[CR, LF]) {
            self.buf.drain(..2);
            return Some(Ok(Decoded::HeartBeat));
        }

        // 超过上限仍未结束的帧直接丢弃，避免缓冲区无限增长
        if self.buf.len() > MAX_FRAME_SIZE && !self.buf.contains(&NUL) {
            self.buf.clear();
            return Some(Err(AppError::protocol("frame exceeds maximum size")));
        }

        let mut lines = Vec::new();
        let mut pos = 0;
        let body_start = loop {
            let Some(offset) = self.buf[pos..].iter().position(|&b| b == LF) else {
                return self.fail_if_terminated(pos, "frame ended before headers were complete");
            };
            let nl = pos + offset;
            if self.buf[pos..nl].contains(&NUL) {
                return self.fail_if_terminated(pos, "frame ended before headers were complete");
            }
            let line = trim_cr(&self.buf[pos..nl]);
            if line.is_empty() && !lines.is_empty() {
                break nl + 1;
            }
            lines.push((pos, pos + line.len()));
            pos = nl + 1;
        };

        let parsed = self.parse_head(&lines);
        let (command, headers) = match parsed {
            Ok(head) => head,
            Err(e) => return self.fail_if_terminated(body_start, &e.to_string()),
        };

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| v.trim().parse::<usize>());

        let (body_end, frame_end) = match content_length {
            Some(Ok(len)) => {
                let body_end = match body_start.checked_add(len) {
                    Some(end) if end <= MAX_FRAME_SIZE => end,
                    _ => {
                        return self.fail_if_terminated(
                            body_start,
                            "content-length exceeds maximum frame size",
                        )
                    }
                };
                if self.buf.len() <= body_end {
                    return None;
                }
                if self.buf[body_end] != NUL {
                    return self.fail_if_terminated(body_end, "body longer than content-length");
                }
                (body_end, body_end + 1)
            }
            Some(Err(_)) => return self.fail_if_terminated(body_start, "invalid content-length"),
            None => match self.buf[body_start..].iter().position(|&b| b == NUL) {
                Some(offset) if body_start + offset > MAX_FRAME_SIZE => {
                    return self.fail_if_terminated(body_start, "frame exceeds maximum size");
                }
                Some(offset) => (body_start + offset, body_start + offset + 1),
                None => return None,
            },
        };

        let body = std::str::from_utf8(&self.buf[body_start..body_end])
            .map(str::to_owned)
            .map_err(AppError::from);
        self.buf.drain(..frame_end);

        Some(body.map(|body| {
            Decoded::Frame(Frame {
                command,
                headers,
                body,
            })
        }))
    }

    fn parse_head(&self, lines: &[(usize, usize)]) -> Result<(Command, Vec<(String, String)>)> {
        let mut iter = lines.iter();
        let (start, end) = iter
            .next()
            .ok_or_else(|| AppError::protocol("missing command line"))?;
        let command_line = std::str::from_utf8(&self.buf[*start..*end])?;
        let command = Command::parse(command_line)
            .ok_or_else(|| AppError::Protocol(format!("unknown command: {}", command_line)))?;

        let mut headers = Vec::with_capacity(lines.len() - 1);
        for (start, end) in iter {
            let line = std::str::from_utf8(&self.buf[*start..*end])?;
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| AppError::Protocol(format!("malformed header line: {}", line)))?;
            if command.escapes_headers() {
                headers.push((unescape(name)?, unescape(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }
        Ok((command, headers))
    }

    // 仅当畸形帧已完整到达（存在 NUL）时才丢弃并报错，否则继续等待数据
    fn fail_if_terminated(&mut self, from: usize, reason: &str) -> Option<Result<Decoded>> {
        let from = from.min(self.buf.len());
        let nul = self.buf[from..].iter().position(|&b| b == NUL)? + from;
        self.buf.drain(..=nul);
        Some(Err(AppError::Protocol(reason.to_string())))
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    match line {
        [rest @ .., CR] => rest,
        _ => line,
    }
}

/// `heart-beat` 头部：`<发送间隔>,<期望接收间隔>`，单位毫秒，0 表示不启用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    pub outgoing_ms: u64,
    pub incoming_ms: u64,
}

impl HeartBeat {
    pub fn new(outgoing: Duration, incoming: Duration) -> Self {
        Self {
            outgoing_ms: u64::try_from(outgoing.as_millis()).unwrap_or(u64::MAX),
            incoming_ms: u64::try_from(incoming.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let (outgoing, incoming) = value
            .split_once(',')
            .ok_or_else(|| AppError::Protocol(format!("invalid heart-beat header: {}", value)))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| AppError::Protocol(format!("invalid heart-beat header: {}", value)))
        };
        Ok(Self {
            outgoing_ms: parse(outgoing)?,
            incoming_ms: parse(incoming)?,
        })
    }

    /// 协商心跳周期，返回 (客户端发送周期, 服务端数据期望周期)
    pub fn negotiate(&self, server: &HeartBeat) -> (Option<Duration>, Option<Duration>) {
        let period = |ours: u64, theirs: u64| {
            if ours == 0 || theirs == 0 {
                None
            } else {
                Some(Duration::from_millis(ours.max(theirs)))
            }
        };
        (
            period(self.outgoing_ms, server.incoming_ms),
            period(self.incoming_ms, server.outgoing_ms),
        )
    }
}

impl std::fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.outgoing_ms, self.incoming_ms)
    }
}
