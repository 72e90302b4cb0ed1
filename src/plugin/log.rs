use crate::message::{Request, Response};
use crate::plugin::{Handler, Next};
use crate::types::rcode_to_str;
use anyhow::Result;

pub const DEFAULT_TEMPLATE: &str = "{remote}:{port} {transport} {name} {type} {class} {rcode} {flags} answers={answers} {duration}ms";

/// Middleware that logs each query and its outcome through `tracing`.
///
/// Placeholders: `{remote}` `{port}` `{name}` `{type}` `{class}` `{transport}`
/// `{rcode}` `{flags}` `{answers}` `{duration}`. Unknown placeholders are left as is.
pub struct QueryLogger {
    template: String,
}

impl QueryLogger {
    pub fn new(template: impl Into<String>) -> Self {
        Self { template: template.into() }
    }

    pub fn template(&self) -> &str { &self.template }

    pub fn format(&self, req: &Request, res: &Response) -> String {
        let conn = req.connection();
        let (name, qtype, qclass) = match req.question() {
            Some(q) => (q.name.as_str(), q.qtype.to_string(), q.qclass.to_string()),
            None => (".", "-".to_string(), "-".to_string()),
        };
        let rcode = if res.is_finished() { rcode_to_str(res.message().rcode()) } else { "-" };

        let mut out = String::with_capacity(self.template.len() + 64);
        let mut rest = self.template.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let tail = &rest[open..];
            let Some(close) = tail.find('}') else {
                rest = tail;
                break;
            };
            let key = &tail[1..close];
            match key {
                "remote" => out.push_str(&conn.remote_address.to_string()),
                "port" => out.push_str(&conn.remote_port.to_string()),
                "name" => out.push_str(name),
                "type" => out.push_str(&qtype),
                "class" => out.push_str(&qclass),
                "transport" => out.push_str(conn.kind.as_str()),
                "rcode" => out.push_str(rcode),
                "flags" => out.push_str(&format!("{:#06x}", res.flags())),
                "answers" => out.push_str(&res.answers().len().to_string()),
                "duration" => out.push_str(&format!("{:.3}", conn.elapsed().as_secs_f64() * 1000.0)),
                _ => out.push_str(&tail[..=close]),
            }
            rest = &tail[close + 1..];
        }
        out.push_str(rest);
        out
    }
}

impl Default for QueryLogger {
    fn default() -> Self { Self::new(DEFAULT_TEMPLATE) }
}

#[async_trait::async_trait]
impl Handler for QueryLogger {
    fn name(&self) -> &str { "log" }

    async fn handle(&self, req: &Request, res: &mut Response, next: Next<'_>) -> Result<()> {
        if let Some(q) = req.question() {
            tracing::debug!("=> [Incoming Query] TxID: {:#06x} {} {} from {}", req.id(), q.name, q.qtype, req.connection().peer());
        }
        let outcome = next.run(req, res).await;
        match &outcome {
            Ok(()) => tracing::info!("[log] {}", self.format(req, res)),
            Err(e) => tracing::warn!("[log] {} error: {:#}", self.format(req, res), e),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Connection, TransportKind};
    use crate::types::{Message, Question, RData, Record, RecordType};
    use std::net::Ipv4Addr;

    #[test]
    fn fills_placeholders_from_request_and_response() {
        let req = Request::new(
            Message::query(3, Question::new("example.com", RecordType::AAAA)),
            Connection::new("10.1.2.3:4444".parse().unwrap(), TransportKind::Tcp),
        );
        let (mut res, _done) = req.to_response();
        let logger = QueryLogger::new("{remote} {port} {transport} {name} {type} {class} {rcode} {answers} {unknown}");
        assert_eq!(logger.format(&req, &res), "10.1.2.3 4444 tcp example.com AAAA IN - 0 {unknown}");

        res.answer(vec![Record::new("example.com", 1, RData::A(Ipv4Addr::LOCALHOST))]).unwrap();
        assert_eq!(logger.format(&req, &res), "10.1.2.3 4444 tcp example.com AAAA IN NOERROR 1 {unknown}");
    }

    #[test]
    fn unterminated_placeholder_is_kept_verbatim() {
        let req = Request::new(
            Message::query(3, Question::new("example.com", RecordType::A)),
            Connection::new("127.0.0.1:1".parse().unwrap(), TransportKind::Udp),
        );
        let (res, _done) = req.to_response();
        assert_eq!(QueryLogger::new("{name} {oops").format(&req, &res), "example.com {oops");
    }
}
