//! Corefile-style configuration.
//!
//! ```text
//! listen {
//!     udp 0.0.0.0:1053
//!     tcp 0.0.0.0:1053
//! }
//! . {
//!     log
//!     cache 10000
//!     store {
//!         example.com A 300 127.0.0.1
//!     }
//!     default nxdomain
//! }
//! corp.example *.corp.example {
//!     forward 10.0.0.1 tls://9.9.9.9
//! }
//! ```
//!
//! The `.` block lists global middleware in execution order; every other block
//! registers its handlers under each of its names as route patterns.

use crate::plugin::cache::{Cache, CacheHandler};
use crate::plugin::forward::{parse_rcode, ForwardOptions, Forwarder, Policy};
use crate::plugin::log::QueryLogger;
use crate::plugin::prometheus::PrometheusPlugin;
use crate::plugin::store::ZoneStore;
use crate::plugin::Handler;
use crate::server::{DefaultHandler, DnsServer};
use crate::trie::ZoneTrie;
use crate::types::{RData, Rcode, Record, RecordType};
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// One line of configuration, with its optional nested block.
#[derive(Clone, Debug, PartialEq)]
pub struct Directive {
    pub name: String,
    pub args: Vec<String>,
    pub block: Vec<Directive>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerBlock {
    pub patterns: Vec<String>,
    pub directives: Vec<Directive>,
}

impl ServerBlock {
    pub fn is_global(&self) -> bool { self.patterns.iter().any(|p| p == ".") }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Listener {
    Udp(SocketAddr),
    Tcp(SocketAddr),
    Http(SocketAddr),
}

#[derive(Clone, Debug, Default)]
pub struct Config {
    pub listeners: Vec<Listener>,
    pub blocks: Vec<ServerBlock>,
}

#[derive(Debug, PartialEq)]
enum Token { Text(String), OpenBrace, CloseBrace, Newline }

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let tokens = lex(content);
        let mut config = Config::default();
        for block in parse_server_blocks(&tokens)? {
            if block.patterns.iter().any(|p| p == "listen") {
                for d in &block.directives {
                    config.listeners.push(parse_listener(d)?);
                }
            } else {
                config.blocks.push(block);
            }
        }
        Ok(config)
    }

    /// Builds a server from this configuration. `fallback` is bound on UDP and
    /// TCP when no `listen` block is present.
    pub async fn build_server(&self, fallback: SocketAddr) -> Result<DnsServer> {
        let mut server = DnsServer::new();
        let trie = Arc::new(ZoneTrie::new());
        let cache = self.find_cache()?;

        let mut builder = HandlerBuilder { trie, cache };
        for block in &self.blocks {
            let global = block.is_global();
            for d in &block.directives {
                if d.name == "default" {
                    if !global { bail!("'default' is only allowed in the '.' block"); }
                    let rcode = d.args.first().and_then(|a| Rcode::parse(a))
                        .with_context(|| format!("default needs an rcode, got {:?}", d.args))?;
                    server.default_handler(Arc::new(DefaultHandler::new(rcode)));
                    continue;
                }
                let handler = builder.build(d).await?;
                if global {
                    server.use_middleware(handler);
                } else {
                    for pattern in &block.patterns {
                        server.handle(pattern, handler.clone())?;
                    }
                }
            }
        }

        let listeners = if self.listeners.is_empty() {
            vec![Listener::Udp(fallback), Listener::Tcp(fallback)]
        } else {
            self.listeners.clone()
        };
        for listener in listeners {
            match listener {
                Listener::Udp(addr) => server.listen_udp(addr),
                Listener::Tcp(addr) => server.listen_tcp(addr),
                Listener::Http(addr) => server.listen_http(addr),
            };
        }
        Ok(server)
    }

    /// The one cache all `cache` and `store` directives share.
    fn find_cache(&self) -> Result<Option<Arc<Cache>>> {
        let mut found = None;
        for d in self.blocks.iter().flat_map(|b| b.directives.iter()).filter(|d| d.name == "cache") {
            let max_entries = match d.args.first() {
                Some(n) => Some(n.parse::<usize>().with_context(|| format!("invalid cache size '{}'", n))?),
                None => None,
            };
            if found.is_some() { bail!("only one cache directive is supported"); }
            found = Some(Arc::new(Cache::new(max_entries)));
        }
        Ok(found)
    }
}

struct HandlerBuilder {
    trie: Arc<ZoneTrie>,
    cache: Option<Arc<Cache>>,
}

impl HandlerBuilder {
    async fn build(&mut self, d: &Directive) -> Result<Arc<dyn Handler>> {
        let handler: Arc<dyn Handler> = match d.name.as_str() {
            "log" => match d.args.first() {
                Some(template) => Arc::new(QueryLogger::new(template.clone())),
                None => Arc::new(QueryLogger::default()),
            },
            "cache" => {
                let cache = self.cache.clone().context("cache directive without a cache")?;
                tracing::info!("[cache] Initialized with max_entries {:?}", cache.max_entries());
                Arc::new(CacheHandler::with_resolver(cache, self.trie.clone()))
            }
            "store" => {
                for line in &d.block {
                    let record = parse_record(line)?;
                    self.trie.append(&line.name, record.record_type(), record);
                }
                tracing::info!("[store] Loaded {} record(s)", d.block.len());
                let store = ZoneStore::with_trie(self.trie.clone());
                match &self.cache {
                    Some(cache) => Arc::new(store.with_cache(cache.clone())),
                    None => Arc::new(store),
                }
            }
            "forward" => Arc::new(Forwarder::new(&d.args, parse_forward_options(&d.block)?)?),
            "prometheus" => {
                let plugin = PrometheusPlugin::new();
                let addr = parse_listen_addr(d.args.first().map(String::as_str).unwrap_or(":9153"))?;
                plugin.serve(addr).await?;
                if let Some(cache) = &self.cache {
                    plugin.observe_cache(cache.clone());
                }
                Arc::new(plugin)
            }
            other => bail!("unknown directive '{}'", other),
        };
        Ok(handler)
    }
}

fn parse_listener(d: &Directive) -> Result<Listener> {
    let addr = d.args.first().with_context(|| format!("listen {} needs an address", d.name))?;
    let addr = parse_listen_addr(addr)?;
    match d.name.as_str() {
        "udp" => Ok(Listener::Udp(addr)),
        "tcp" => Ok(Listener::Tcp(addr)),
        "http" => Ok(Listener::Http(addr)),
        other => bail!("unknown listener kind '{}'", other),
    }
}

/// `:9153` binds every interface.
pub fn parse_listen_addr(s: &str) -> Result<SocketAddr> {
    let full = if s.starts_with(':') { format!("0.0.0.0{}", s) } else { s.to_string() };
    full.parse().with_context(|| format!("invalid listen address '{}'", s))
}

/// `<name> <TYPE> <ttl> <data...>`
fn parse_record(line: &Directive) -> Result<Record> {
    let [rtype, ttl, data @ ..] = line.args.as_slice() else {
        bail!("record '{}' needs a type, a ttl and data", line.name);
    };
    let rtype: RecordType = rtype.parse()?;
    let ttl: u32 = ttl.parse().with_context(|| format!("invalid ttl '{}' for {}", ttl, line.name))?;
    Ok(Record::new(line.name.clone(), ttl, RData::parse(rtype, data)?))
}

fn parse_forward_options(block: &[Directive]) -> Result<ForwardOptions> {
    let mut options = ForwardOptions::default();
    let first = |d: &Directive| d.args.first().cloned().with_context(|| format!("{} needs a value", d.name));
    for d in block {
        match d.name.as_str() {
            "policy" => options.policy = first(d)?.parse::<Policy>()?,
            "timeout" => options.timeout = parse_duration(&first(d)?)?,
            "failover" => {
                options.failover_rcodes = d.args.iter().map(|a| parse_rcode(a)).collect::<Result<_>>()?;
            }
            "tls_servername" => options.tls_servername = Some(first(d)?),
            "max_concurrent" => options.max_concurrent = Some(first(d)?.parse()?),
            "max_fails" => options.max_fails = first(d)?.parse()?,
            "health_check" => options.health_check = Some(parse_duration(&first(d)?)?),
            "max_idle_conns" => options.max_idle_conns = first(d)?.parse()?,
            "expire" => options.expire = parse_duration(&first(d)?)?,
            other => bail!("unknown forward option '{}'", other),
        }
    }
    Ok(options)
}

pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if let Some(stripped) = s.strip_suffix("ms") { Ok(Duration::from_millis(stripped.parse()?)) }
    else if let Some(stripped) = s.strip_suffix('s') { Ok(Duration::from_secs(stripped.parse()?)) }
    else if let Some(stripped) = s.strip_suffix('m') { Ok(Duration::from_secs(stripped.parse::<u64>()? * 60)) }
    else { bail!("invalid duration '{}'", s) }
}

fn lex(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c == '\n' { tokens.push(Token::Newline); chars.next(); }
        else if c.is_whitespace() { chars.next(); }
        else if c == '#' { while let Some(&c) = chars.peek() { if c == '\n' { break; } chars.next(); } }
        else if c == '{' { tokens.push(Token::OpenBrace); chars.next(); }
        else if c == '}' { tokens.push(Token::CloseBrace); chars.next(); }
        else if c == '"' {
            chars.next();
            let mut s = String::new();
            while let Some(c) = chars.next() {
                match c {
                    '"' => break,
                    '\\' => if let Some(escaped) = chars.next() { s.push(escaped) },
                    _ => s.push(c),
                }
            }
            tokens.push(Token::Text(s));
        } else {
            let mut s = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == '#' || c == '{' || c == '}' || c == '"' { break; }
                s.push(c); chars.next();
            }
            tokens.push(Token::Text(s));
        }
    }
    tokens
}

fn parse_server_blocks(tokens: &[Token]) -> Result<Vec<ServerBlock>> {
    let mut i = 0;
    let mut blocks = Vec::new();
    let mut names = Vec::new();
    while i < tokens.len() {
        match &tokens[i] {
            Token::Text(s) => { names.push(s.clone()); i += 1; }
            Token::OpenBrace => {
                if names.is_empty() { bail!("block without a name"); }
                let (directives, next_i) = parse_block(tokens, i + 1)?;
                i = next_i;
                blocks.push(ServerBlock { patterns: std::mem::take(&mut names), directives });
            }
            Token::Newline => {
                if !names.is_empty() { bail!("'{}' is not followed by a block", names.join(" ")); }
                i += 1;
            }
            Token::CloseBrace => bail!("unbalanced '}}'"),
        }
    }
    if !names.is_empty() { bail!("'{}' is not followed by a block", names.join(" ")); }
    Ok(blocks)
}

fn parse_block(tokens: &[Token], mut i: usize) -> Result<(Vec<Directive>, usize)> {
    let mut directives = Vec::new();
    while i < tokens.len() {
        match &tokens[i] {
            Token::Newline => { i += 1; }
            Token::CloseBrace => { return Ok((directives, i + 1)); }
            Token::Text(name) => {
                let name = name.clone(); i += 1;
                let mut args = Vec::new();
                let mut block = Vec::new();
                while i < tokens.len() {
                    match &tokens[i] {
                        Token::Text(arg) => { args.push(arg.clone()); i += 1; }
                        Token::OpenBrace => {
                            let (sub_block, next_i) = parse_block(tokens, i + 1)?;
                            block = sub_block; i = next_i; break;
                        }
                        Token::Newline | Token::CloseBrace => { break; }
                    }
                }
                directives.push(Directive { name, args, block });
            }
            Token::OpenBrace => bail!("unexpected '{{'"),
        }
    }
    bail!("unterminated block")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Connection, TransportKind};
    use crate::types::{Message, Question};

    const SAMPLE: &str = r#"
# sample
listen {
    udp 127.0.0.1:0
    tcp 127.0.0.1:0
}
. {
    log "{name} {type} {rcode}"
    cache 100
    store {
        example.com A 300 127.0.0.1
        *.example.com TXT 60 "hello world"
    }
    default refused
}
corp.example *.corp.example {
    forward 10.0.0.1 tls://9.9.9.9 {
        policy round_robin
        timeout 500ms
        failover SERVFAIL
    }
}
"#;

    #[test]
    fn parses_listeners_blocks_and_nested_directives() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.listeners, vec![
            Listener::Udp("127.0.0.1:0".parse().unwrap()),
            Listener::Tcp("127.0.0.1:0".parse().unwrap()),
        ]);
        assert_eq!(config.blocks.len(), 2);
        assert!(config.blocks[0].is_global());
        assert_eq!(config.blocks[0].directives[0].args, vec!["{name} {type} {rcode}"]);
        let store = &config.blocks[0].directives[2];
        assert_eq!(store.block[1].args, vec!["TXT", "60", "hello world"]);
        assert_eq!(config.blocks[1].patterns, vec!["corp.example", "*.corp.example"]);

        let forward = parse_forward_options(&config.blocks[1].directives[0].block).unwrap();
        assert_eq!(forward.policy, Policy::RoundRobin);
        assert_eq!(forward.timeout, Duration::from_millis(500));
        assert_eq!(forward.failover_rcodes, vec![2]);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(Config::parse(". {\n log\n").is_err());
        assert!(Config::parse("dangling\n").is_err());
        assert!(Config::parse("listen {\n quic 1.2.3.4:53\n}").is_err());
        assert!(parse_duration("10 parsecs").is_err());
    }

    #[tokio::test]
    async fn built_server_answers_from_the_store_and_uses_the_default() {
        let config = Config::parse(SAMPLE).unwrap();
        let server = config.build_server("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_eq!(server.transports().len(), 2);
        let conn = || Connection::new("127.0.0.1:9".parse().unwrap(), TransportKind::Udp);

        let hit = server.query(Message::query(1, Question::new("example.com", RecordType::A)), conn()).await;
        assert_eq!(hit.message().answers.len(), 1);

        let wild = server.query(Message::query(2, Question::new("x.example.com", RecordType::TXT)), conn()).await;
        assert_eq!(wild.message().answers[0].name, "x.example.com");

        let miss = server.query(Message::query(3, Question::new("nowhere.test", RecordType::A)), conn()).await;
        assert_eq!(miss.rcode(), Rcode::Refused as u16);
    }

    #[tokio::test]
    async fn unknown_directives_fail_the_build() {
        let config = Config::parse(". {\n frobnicate\n}").unwrap();
        assert!(config.build_server("127.0.0.1:0".parse().unwrap()).await.is_err());
    }
}
