//! Client command dispatch.
//!
//! One [`Dispatcher`] per client connection: it carries the connection's
//! authentication state, maps the uppercased command token to its handler
//! and turns handler failures into error replies. Per-shard failures never
//! reach this layer; the engine recovers them by skipping the shard.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rcluster_protocol::{Reply, Request};
use rcluster_shard::{Cluster, Endpoint, now_micros};
use tracing::{error, trace};

use crate::error::HandlerError;

/// Every command the proxy answers, sorted; INFO reports this list.
pub const COMMANDS: [&str; 13] = [
    "ADDSHARD",
    "AUTH",
    "CONFIG",
    "DEL",
    "ECHO",
    "GET",
    "INFO",
    "LASTSAVE",
    "PING",
    "QUIT",
    "SET",
    "SETREPLICANESS",
    "TIME",
];

type HandlerResult = Result<Reply, HandlerError>;

/// Per-connection command dispatcher over the shared cluster.
pub struct Dispatcher {
    cluster: Arc<Cluster>,
    password: Option<String>,
    authenticated: bool,
}

impl Dispatcher {
    pub fn new(cluster: Arc<Cluster>, password: Option<String>) -> Self {
        Dispatcher {
            cluster,
            password,
            authenticated: false,
        }
    }

    /// Handles one complete request and produces its reply.
    pub async fn dispatch(&mut self, request: &Request) -> Reply {
        let Some(command) = request.command().cloned() else {
            return unknown(b"");
        };
        trace!(command = %String::from_utf8_lossy(&command), "dispatching");
        let token = command.to_ascii_uppercase();
        if self.password.is_some() && !self.authenticated && token.as_slice() != b"AUTH" {
            return Reply::error("ERR Not authenticated.");
        }
        let arguments = request.arguments();
        let result = match token.as_slice() {
            b"PING" => self.on_ping(arguments),
            b"ECHO" => self.on_echo(arguments),
            b"QUIT" => self.on_quit(arguments),
            b"AUTH" => self.on_auth(arguments),
            b"INFO" => self.on_info(arguments).await,
            b"ADDSHARD" => self.on_add_shard(arguments).await,
            b"SETREPLICANESS" => self.on_set_replicaness(arguments),
            b"CONFIG" => self.on_config(arguments),
            b"TIME" => self.on_time(arguments),
            b"LASTSAVE" => self.on_last_save(arguments).await,
            b"GET" => self.on_get(arguments).await,
            b"SET" => self.on_set(arguments).await,
            b"DEL" => self.on_del(arguments).await,
            _ => return unknown(&command),
        };
        match result {
            Ok(reply) => reply,
            Err(HandlerError::Command(message)) => Reply::error(message),
            Err(HandlerError::Internal(source)) => {
                error!(error = %source, "command handler failed");
                Reply::error("ERR Internal server error.")
            }
        }
    }

    fn on_ping(&self, arguments: &[Option<Bytes>]) -> HandlerResult {
        if arguments.is_empty() {
            Ok(Reply::status("PONG"))
        } else {
            Err(HandlerError::usage("PING"))
        }
    }

    fn on_echo(&self, arguments: &[Option<Bytes>]) -> HandlerResult {
        match arguments {
            [Some(data)] => Ok(Reply::bulk(data.clone())),
            _ => Err(HandlerError::usage("ECHO data")),
        }
    }

    fn on_quit(&self, arguments: &[Option<Bytes>]) -> HandlerResult {
        if arguments.is_empty() {
            Ok(Reply::status("OK Bye!").close_after_send())
        } else {
            Err(HandlerError::usage("QUIT"))
        }
    }

    fn on_auth(&mut self, arguments: &[Option<Bytes>]) -> HandlerResult {
        let [Some(password)] = arguments else {
            return Err(HandlerError::usage("AUTH password"));
        };
        match &self.password {
            None => Err(HandlerError::command(
                "ERR Client sent AUTH, but no password is set.",
            )),
            Some(expected) if expected.as_bytes() == &password[..] => {
                self.authenticated = true;
                Ok(Reply::status("Authenticated."))
            }
            Some(_) => Err(HandlerError::command("ERR Invalid password.")),
        }
    }

    async fn on_info(&self, arguments: &[Option<Bytes>]) -> HandlerResult {
        let section = match arguments {
            [] => None,
            [Some(section)] => Some(section.as_ref()),
            _ => return Err(HandlerError::usage("INFO [section]")),
        };
        Ok(Reply::bulk(self.info_body(section).await))
    }

    /// Assembles the INFO sections. An unknown section name yields an
    /// empty body, not an error.
    async fn info_body(&self, section: Option<&[u8]>) -> String {
        let wants = |name: &str| section.is_none_or(|s| s.eq_ignore_ascii_case(name.as_bytes()));
        let mut lines: Vec<String> = Vec::new();
        if wants("Server") {
            lines.push("# Server".to_owned());
            lines.push(format!("commands:{}", COMMANDS.join(",")));
            lines.push(String::new());
        }
        if wants("Shards") {
            lines.push("# Shards".to_owned());
            lines.push(format!("count:{}", self.cluster.shard_count()));
            lines.push(format!("status:{}", self.cluster.statuses().await));
            lines.push(String::new());
        }
        if wants("Cluster") {
            lines.push("# Cluster".to_owned());
            lines.push(format!("replicaness:{}", self.cluster.replicaness()));
            lines.push(String::new());
        }
        lines.join("\r\n")
    }

    async fn on_add_shard(&self, arguments: &[Option<Bytes>]) -> HandlerResult {
        const USAGE: &str = "ADDSHARD host port db";
        let [Some(host), Some(port), Some(db)] = arguments else {
            return Err(HandlerError::usage(USAGE));
        };
        let endpoint = parse_endpoint(host, port, db).ok_or_else(|| HandlerError::usage(USAGE))?;
        match self.cluster.add_shard(endpoint).await {
            Ok(id) => Ok(Reply::status(format!("OK Shard {id} is added"))),
            Err(source) if source.is_connection() => Err(HandlerError::command(
                "ERR Could not connect to the shard.",
            )),
            Err(source) => Err(HandlerError::Internal(source)),
        }
    }

    fn on_set_replicaness(&self, arguments: &[Option<Bytes>]) -> HandlerResult {
        match arguments {
            [Some(value)] => self.apply_replicaness(value),
            _ => Err(HandlerError::usage("SETREPLICANESS replicaness")),
        }
    }

    fn on_config(&self, arguments: &[Option<Bytes>]) -> HandlerResult {
        match arguments {
            [Some(action), Some(parameter), Some(value)]
                if action.eq_ignore_ascii_case(b"SET")
                    && parameter.eq_ignore_ascii_case(b"replicaness") =>
            {
                self.apply_replicaness(value)
            }
            _ => Err(HandlerError::usage("CONFIG SET replicaness value")),
        }
    }

    fn apply_replicaness(&self, value: &[u8]) -> HandlerResult {
        let replicaness = std::str::from_utf8(value)
            .ok()
            .and_then(|text| text.trim().parse::<i64>().ok())
            .filter(|n| *n >= 1)
            .ok_or_else(|| HandlerError::command("ERR Invalid replicaness value."))?;
        if self.cluster.set_replicaness(replicaness as usize) {
            Ok(Reply::status("OK"))
        } else {
            Ok(Reply::status("OK Add more shards."))
        }
    }

    fn on_time(&self, arguments: &[Option<Bytes>]) -> HandlerResult {
        if !arguments.is_empty() {
            return Err(HandlerError::usage("TIME"));
        }
        let micros = now_micros();
        let seconds = micros.div_euclid(1_000_000);
        let in_second = micros.rem_euclid(1_000_000);
        Ok(Reply::multi_bulk(vec![
            Reply::bulk(seconds.to_string()),
            Reply::bulk(in_second.to_string()),
        ]))
    }

    async fn on_last_save(&self, arguments: &[Option<Bytes>]) -> HandlerResult {
        if arguments.is_empty() {
            Ok(Reply::integer(self.cluster.last_save().await))
        } else {
            Err(HandlerError::usage("LASTSAVE"))
        }
    }

    async fn on_get(&self, arguments: &[Option<Bytes>]) -> HandlerResult {
        let [Some(key)] = arguments else {
            return Err(HandlerError::usage("GET key"));
        };
        match self.cluster.get(key).await {
            Some(data) => Ok(Reply::bulk(data)),
            None => Ok(Reply::null()),
        }
    }

    async fn on_set(&self, arguments: &[Option<Bytes>]) -> HandlerResult {
        let [Some(key), value] = arguments else {
            return Err(HandlerError::usage("SET key value"));
        };
        let report = self.cluster.set(key, value.as_deref()).await;
        if report.replicas > 0 {
            Ok(Reply::status("OK"))
        } else {
            Err(HandlerError::command(
                "ERR The key is not set - possible cluster failure.",
            ))
        }
    }

    async fn on_del(&self, arguments: &[Option<Bytes>]) -> HandlerResult {
        const USAGE: &str = "DEL key [key ...]";
        if arguments.is_empty() {
            return Err(HandlerError::usage(USAGE));
        }
        let mut removed = 0;
        for argument in arguments {
            let Some(key) = argument else {
                return Err(HandlerError::usage(USAGE));
            };
            if self.cluster.del(key).await {
                removed += 1;
            }
        }
        Ok(Reply::integer(removed))
    }
}

fn unknown(token: &[u8]) -> Reply {
    let mut message = BytesMut::from(&b"ERR Unknown command: "[..]);
    message.extend_from_slice(token);
    Reply::error(message.freeze())
}

fn parse_endpoint(host: &[u8], port: &[u8], db: &[u8]) -> Option<Endpoint> {
    let host = std::str::from_utf8(host).ok()?;
    let port = std::str::from_utf8(port).ok()?.trim().parse().ok()?;
    let db = std::str::from_utf8(db).ok()?.trim().parse().ok()?;
    Some(Endpoint::new(host, port, db))
}
