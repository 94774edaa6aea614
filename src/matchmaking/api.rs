//! Request and response bodies of the matchmaking HTTP API.
//!
//! Both the client and the service use these, so every shape can be written and read.

use std::net::{IpAddr, SocketAddr};

use super::json::{self, ObjectWriter};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateLobbyRequest {
    /// None when the public endpoint couldn't be discovered. The service then uses the
    /// address the request came from.
    pub host_ip: Option<IpAddr>,
    pub host_port: u16,
    pub name: String,
    pub public: bool,
    pub game_version: String,
    pub lobby_type: String,
}

impl CreateLobbyRequest {
    pub fn to_json(&self) -> String {
        let mut w = ObjectWriter::new();
        if let Some(ip) = self.host_ip {
            w = w.str("hostIp", &ip.to_string());
        }
        w.number("hostPort", self.host_port)
            .str("name", &self.name)
            .bool("isPublic", self.public)
            .str("gameVersion", &self.game_version)
            .str("lobbyType", &self.lobby_type)
            .finish()
    }

    pub fn from_json(body: &str) -> Result<Self> {
        Ok(Self {
            host_ip: json::find_str(body, "hostIp").and_then(|s| s.parse().ok()),
            host_port: json::find_number(body, "hostPort")
                .ok_or(Error::UnexpectedResponse("hostPort"))?,
            name: json::find_str(body, "name")
                .map(Into::into)
                .unwrap_or_default(),
            public: json::find_bool(body, "isPublic").unwrap_or(true),
            game_version: json::find_str(body, "gameVersion")
                .map(Into::into)
                .unwrap_or_default(),
            lobby_type: json::find_str(body, "lobbyType")
                .map(Into::into)
                .unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateLobbyResponse {
    pub lobby_id: String,
    pub lobby_code: String,
    pub host_token: String,
}

impl CreateLobbyResponse {
    pub fn to_json(&self) -> String {
        ObjectWriter::new()
            .str("lobbyId", &self.lobby_id)
            .str("lobbyCode", &self.lobby_code)
            .str("hostToken", &self.host_token)
            .finish()
    }

    pub fn from_json(body: &str) -> Result<Self> {
        let get = |key| {
            json::find_str(body, key)
                .map(|s| s.into_owned())
                .ok_or(Error::UnexpectedResponse(key))
        };
        Ok(Self {
            lobby_id: get("lobbyId")?,
            lobby_code: get("lobbyCode")?,
            host_token: get("hostToken")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinLobbyRequest {
    pub client_port: u16,
}

impl JoinLobbyRequest {
    pub fn to_json(&self) -> String {
        ObjectWriter::new()
            .number("clientPort", self.client_port)
            .finish()
    }

    pub fn from_json(body: &str) -> Result<Self> {
        Ok(Self {
            client_port: json::find_number(body, "clientPort")
                .ok_or(Error::UnexpectedResponse("clientPort"))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinLobbyResponse {
    pub host: SocketAddr,
    pub lobby_type: String,
}

impl JoinLobbyResponse {
    pub fn to_json(&self) -> String {
        ObjectWriter::new()
            .str("hostIp", &self.host.ip().to_string())
            .number("hostPort", self.host.port())
            .str("lobbyType", &self.lobby_type)
            .finish()
    }

    pub fn from_json(body: &str) -> Result<Self> {
        let ip: IpAddr = json::find_str(body, "hostIp")
            .and_then(|s| s.parse().ok())
            .ok_or(Error::UnexpectedResponse("hostIp"))?;
        let port = json::find_number(body, "hostPort")
            .ok_or(Error::UnexpectedResponse("hostPort"))?;
        Ok(Self {
            host: SocketAddr::new(ip, port),
            lobby_type: json::find_str(body, "lobbyType")
                .map(Into::into)
                .unwrap_or_default(),
        })
    }
}

/// A joiner the host should punch towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingPeer {
    pub addr: SocketAddr,
}

impl PendingPeer {
    pub fn to_json(&self) -> String {
        ObjectWriter::new()
            .str("clientIp", &self.addr.ip().to_string())
            .number("clientPort", self.addr.port())
            .finish()
    }

    pub fn from_json(body: &str) -> Option<Self> {
        let ip: IpAddr = json::find_str(body, "clientIp")?.parse().ok()?;
        let port = json::find_number(body, "clientPort")?;
        Some(Self {
            addr: SocketAddr::new(ip, port),
        })
    }

    /// Malformed entries are skipped.
    pub fn list_from_json(body: &str) -> Vec<Self> {
        json::objects_in_array(body, None)
            .into_iter()
            .filter_map(Self::from_json)
            .collect()
    }

    pub fn list_to_json(peers: &[Self]) -> String {
        json::array_of(peers.iter().map(Self::to_json))
    }
}

/// One row of the public lobby browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyInfo {
    pub lobby_id: String,
    pub lobby_code: String,
    pub name: String,
    pub lobby_type: String,
    pub game_version: String,
}

impl LobbyInfo {
    pub fn to_json(&self) -> String {
        ObjectWriter::new()
            .str("lobbyId", &self.lobby_id)
            .str("lobbyCode", &self.lobby_code)
            .str("name", &self.name)
            .str("lobbyType", &self.lobby_type)
            .str("gameVersion", &self.game_version)
            .finish()
    }

    pub fn from_json(body: &str) -> Option<Self> {
        let get = |key| json::find_str(body, key).map(|s| s.into_owned());
        Some(Self {
            lobby_id: get("lobbyId")?,
            lobby_code: get("lobbyCode").unwrap_or_default(),
            name: get("name").unwrap_or_default(),
            lobby_type: get("lobbyType").unwrap_or_default(),
            game_version: get("gameVersion").unwrap_or_default(),
        })
    }

    pub fn list_from_json(body: &str) -> Vec<Self> {
        json::objects_in_array(body, None)
            .into_iter()
            .filter_map(Self::from_json)
            .collect()
    }

    pub fn list_to_json(lobbies: &[Self]) -> String {
        json::array_of(lobbies.iter().map(Self::to_json))
    }
}

pub fn error_json(message: &str) -> String {
    ObjectWriter::new().str("error", message).finish()
}

/// The message of an `{"error": ...}` body, or the body itself.
pub fn error_message(body: &str) -> String {
    match json::find_str(body, "error") {
        Some(m) => m.into_owned(),
        None => body.trim().to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_without_ip() {
        let req = CreateLobbyRequest {
            host_ip: None,
            host_port: 7777,
            name: "Friday \"night\"".into(),
            public: false,
            game_version: "1.2.0".into(),
            lobby_type: "coop".into(),
        };
        let body = req.to_json();
        assert!(!body.contains("hostIp"));
        assert_eq!(CreateLobbyRequest::from_json(&body).unwrap(), req);
    }

    #[test]
    fn test_create_response_missing_key() {
        let r = CreateLobbyResponse::from_json(r#"{"lobbyId":"a","lobbyCode":"ABC"}"#);
        assert!(matches!(r, Err(Error::UnexpectedResponse("hostToken"))));
    }

    #[test]
    fn test_join_response() {
        let r = JoinLobbyResponse::from_json(
            r#"{"hostIp":"203.0.113.7","hostPort":54321,"lobbyType":"versus"}"#,
        )
        .unwrap();
        assert_eq!(r.host, "203.0.113.7:54321".parse().unwrap());
        assert_eq!(r.lobby_type, "versus");
        assert!(JoinLobbyResponse::from_json(r#"{"hostIp":"nope","hostPort":1}"#).is_err());
    }

    #[test]
    fn test_pending_list_skips_malformed() {
        let body = r#"[{"clientIp":"10.0.0.2","clientPort":4000},{"clientIp":"x"},{"clientIp":"10.0.0.3","clientPort":4001}]"#;
        let peers = PendingPeer::list_from_json(body);
        assert_eq!(
            peers,
            vec![
                PendingPeer {
                    addr: "10.0.0.2:4000".parse().unwrap()
                },
                PendingPeer {
                    addr: "10.0.0.3:4001".parse().unwrap()
                },
            ]
        );
        assert_eq!(PendingPeer::list_from_json(&PendingPeer::list_to_json(&peers)), peers);
    }

    #[test]
    fn test_error_message() {
        assert_eq!(error_message(&error_json("lobby not found")), "lobby not found");
        assert_eq!(error_message(" Bad Gateway\n"), "Bad Gateway");
    }
}
