//! SOCKS5 front-end (C9, spec.md §4.8), grounded on
//! `original_source/main.c`'s `socks5_thread`: RFC 1928 method negotiation,
//! RFC 1929 username/password sub-negotiation, then a CONNECT request parsed
//! straight off the wire. The actual connect (direct or via an NTLM-
//! authenticated upstream) is delegated to [`crate::forwarder::RequestForwarder`]
//! by synthesizing a `CONNECT host:port` request — the forwarder already
//! knows how to pick between direct and proxied routing and how to drive the
//! 407 cycle, so this module only has to speak the SOCKS5 wire format.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::warn;

use proxy_core::{ProxyError, ProxyResult};

use crate::config::ProxyConfig;
use crate::forwarder::{ForwardOutcome, RequestForwarder};
use crate::http::HttpRequest;
use crate::tunnel;

const VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_USERNAME_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE_METHODS: u8 = 0xFF;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

pub struct Socks5Server {
    config: Arc<ProxyConfig>,
    forwarder: Arc<RequestForwarder>,
}

impl Socks5Server {
    pub fn new(config: Arc<ProxyConfig>, forwarder: Arc<RequestForwarder>) -> Self {
        Self { config, forwarder }
    }

    /// Drives one client connection end to end: negotiation, optional
    /// credential check, CONNECT parsing, upstream connect, reply, then
    /// splices client and upstream together until either side closes.
    pub async fn handle<C>(&self, mut client: C) -> ProxyResult<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.negotiate_method(&mut client).await?;

        let (host, port) = self.read_connect_request(&mut client).await?;

        let connect_request = HttpRequest::new("CONNECT", format!("{host}:{port}"), "HTTP/1.1");
        let mut empty = BufReader::new(tokio::io::empty());
        let mut sink = tokio::io::sink();

        match self.forwarder.handle(&mut empty, &mut sink, &connect_request).await {
            Ok(ForwardOutcome::Upgrade { upstream }) => {
                write_connect_reply(&mut client, REP_SUCCESS).await?;
                tunnel::splice(client, upstream).await
            }
            Ok(ForwardOutcome::Done { .. }) => {
                write_connect_reply(&mut client, REP_GENERAL_FAILURE).await?;
                Err(ProxyError::protocol_violation("upstream refused the SOCKS5 CONNECT target"))
            }
            Err(error) => {
                let _ = write_connect_reply(&mut client, REP_GENERAL_FAILURE).await;
                Err(error)
            }
        }
    }

    /// RFC 1928 §3 method negotiation, narrowed to the two schemes cntlm
    /// supports: no-auth when the user table is empty ("wide open", matching
    /// `socks5_thread`'s `open = !hlist_count(users_list)`), username/password
    /// otherwise.
    async fn negotiate_method<C>(&self, client: &mut C) -> ProxyResult<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut header = [0u8; 2];
        client.read_exact(&mut header).await.map_err(ProxyError::from)?;
        if header[0] != VERSION {
            return Err(ProxyError::protocol_violation("SOCKS5 negotiation did not start with version byte 5"));
        }

        let mut methods = vec![0u8; header[1] as usize];
        client.read_exact(&mut methods).await.map_err(ProxyError::from)?;

        let open = self.config.socks5_users.is_empty();
        let chosen = if open && methods.contains(&AUTH_NONE) {
            Some(AUTH_NONE)
        } else if methods.contains(&AUTH_USERNAME_PASSWORD) {
            Some(AUTH_USERNAME_PASSWORD)
        } else {
            None
        };

        let Some(method) = chosen else {
            let _ = client.write_all(&[VERSION, AUTH_NO_ACCEPTABLE_METHODS]).await;
            return Err(ProxyError::auth_denied("client offered no SOCKS5 auth method this server accepts"));
        };
        client.write_all(&[VERSION, method]).await.map_err(ProxyError::from)?;

        if method == AUTH_USERNAME_PASSWORD {
            self.check_username_password(client).await?;
        }
        Ok(())
    }

    /// RFC 1929 username/password sub-negotiation.
    async fn check_username_password<C>(&self, client: &mut C) -> ProxyResult<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut ver_ulen = [0u8; 2];
        client.read_exact(&mut ver_ulen).await.map_err(ProxyError::from)?;
        let ulen = ver_ulen[1] as usize;

        let mut username_and_plen = vec![0u8; ulen + 1];
        client.read_exact(&mut username_and_plen).await.map_err(ProxyError::from)?;
        let username = username_and_plen[..ulen].to_vec();
        let plen = username_and_plen[ulen] as usize;

        let mut password = vec![0u8; plen];
        client.read_exact(&mut password).await.map_err(ProxyError::from)?;

        let ok = self.config.socks5_users.is_empty() || self.config.socks5_users.check(&username, &password);
        client.write_all(&[0x01, if ok { 0x00 } else { 0xFF }]).await.map_err(ProxyError::from)?;

        if ok {
            Ok(())
        } else {
            Err(ProxyError::auth_denied("SOCKS5 username/password check failed"))
        }
    }

    /// RFC 1928 §4 CONNECT request, IPv4 and domain-name address types only
    /// (BIND and UDP ASSOCIATE, and the IPv6 address type, are rejected the
    /// same way `socks5_thread` rejects anything but `bs[3] in {1,3}`).
    async fn read_connect_request<C>(&self, client: &mut C) -> ProxyResult<(String, u16)>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut head = [0u8; 4];
        client.read_exact(&mut head).await.map_err(ProxyError::from)?;
        let (version, command, address_type) = (head[0], head[1], head[3]);

        if version != VERSION || command != 0x01 {
            let _ = write_connect_reply(client, REP_COMMAND_NOT_SUPPORTED).await;
            return Err(ProxyError::protocol_violation(
                "SOCKS5 request is not a CONNECT (BIND/UDP-ASSOCIATE unsupported)",
            ));
        }
        if address_type != ATYP_IPV4 && address_type != ATYP_DOMAIN {
            let _ = write_connect_reply(client, REP_ADDRESS_TYPE_NOT_SUPPORTED).await;
            return Err(ProxyError::protocol_violation(
                "SOCKS5 request uses an unsupported address type (IPv4/domain only)",
            ));
        }

        let host = if address_type == ATYP_IPV4 {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets).await.map_err(ProxyError::from)?;
            format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3])
        } else {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await.map_err(ProxyError::from)?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await.map_err(ProxyError::from)?;
            String::from_utf8(name).map_err(|_| ProxyError::protocol_violation("SOCKS5 domain name is not valid UTF-8"))?
        };

        let mut port_bytes = [0u8; 2];
        client.read_exact(&mut port_bytes).await.map_err(ProxyError::from)?;
        Ok((host, u16::from_be_bytes(port_bytes)))
    }
}

/// Writes a ten-byte CONNECT reply with a dummy `0.0.0.0:0` bound address —
/// real clients ignore BND.ADDR/BND.PORT for CONNECT, matching cntlm's own
/// `bs[3] = 1; memset(bs+4, 0, 6)` placeholder.
async fn write_connect_reply<C>(client: &mut C, rep: u8) -> ProxyResult<()>
where
    C: AsyncWrite + Unpin,
{
    let reply = [VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    client.write_all(&reply).await.map_err(ProxyError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfigBuilder, Socks5UserTable};
    use crate::credential::{AuthPolicy, Credential};
    use crate::pool::ConnectionPool;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    fn test_config(socks5_users: Socks5UserTable) -> Arc<ProxyConfig> {
        Arc::new(
            ProxyConfigBuilder::default()
                .credential(Credential::from_hashes("alice", "CORP", "WS01", AuthPolicy::ntlm(), None, None, None, None))
                .listeners(Vec::new())
                .socks5_users(socks5_users)
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn negotiation_rejects_non_version_5_byte() {
        let config = test_config(Socks5UserTable::default());
        let pool = Arc::new(ConnectionPool::new(Duration::from_secs(60)));
        let server = Socks5Server::new(config.clone(), Arc::new(RequestForwarder::new(config, pool)));

        let (mut test_end, server_end) = duplex(64);
        test_end.write_all(&[4, 1, 0]).await.unwrap();
        drop(test_end);

        assert!(server.handle(server_end).await.is_err());
    }

    #[tokio::test]
    async fn open_server_accepts_no_auth_and_connects_direct() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let config = test_config(Socks5UserTable::default());
        let pool = Arc::new(ConnectionPool::new(Duration::from_secs(60)));
        let server = Socks5Server::new(config.clone(), Arc::new(RequestForwarder::new(config, pool)));

        let (mut test_end, server_end) = duplex(256);
        let handle = tokio::spawn(async move { server.handle(server_end).await });

        test_end.write_all(&[5, 1, 0]).await.unwrap();
        let mut method_reply = [0u8; 2];
        test_end.read_exact(&mut method_reply).await.unwrap();
        assert_eq!(method_reply, [5, 0]);

        let ip = addr.ip().to_string();
        let octets: Vec<u8> = ip.split('.').map(|s| s.parse().unwrap()).collect();
        let mut connect_req = vec![5, 1, 0, 1];
        connect_req.extend_from_slice(&octets);
        connect_req.extend_from_slice(&addr.port().to_be_bytes());
        test_end.write_all(&connect_req).await.unwrap();

        let (_server_side, _) = accept.await.unwrap();

        let mut connect_reply = [0u8; 10];
        test_end.read_exact(&mut connect_reply).await.unwrap();
        assert_eq!(&connect_reply[0..2], &[5, 0]);

        drop(test_end);
        let _ = handle.await.unwrap();
    }
}
