use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::proto;

const DNS_PORT: u16 = 53;
const DOT_PORT: u16 = 853;
const DOH_PORT: u16 = 443;
const MAX_FRAME: usize = 64 * 1024;
// Small DoH queries go out as GET for cacheability, larger ones as POST.
const DOH_GET_THRESHOLD: usize = 256;

/// SOCKS5 proxy endpoint for TCP-family callers.
#[derive(Debug, Clone)]
pub struct Socks5Proxy {
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// An upstream DNS transport. One variant per wire protocol; failure is
/// an error the group layer logs and treats as no answer.
pub enum Caller {
    Udp(UdpCaller),
    Tcp(TcpCaller),
    Dot(DotCaller),
    Doh(DohCaller),
}

impl Caller {
    /// Parse a caller spec: `udp://ip:port` (scheme and port optional),
    /// `tcp://ip:port`, `tls://server-name@ip:port`,
    /// `https://host/dns-query`.
    pub fn parse(spec: &str, call_timeout: Duration, proxy: Option<Socks5Proxy>) -> Result<Caller> {
        if let Some(rest) = spec.strip_prefix("udp://") {
            Ok(Caller::Udp(UdpCaller {
                addr: parse_addr(rest, DNS_PORT)?,
                timeout: call_timeout,
            }))
        } else if let Some(rest) = spec.strip_prefix("tcp://") {
            Ok(Caller::Tcp(TcpCaller {
                addr: parse_addr(rest, DNS_PORT)?,
                timeout: call_timeout,
                proxy,
            }))
        } else if let Some(rest) = spec.strip_prefix("tls://") {
            let (server_name, addr) = rest
                .split_once('@')
                .with_context(|| format!("dot caller needs server-name@ip:port: {spec}"))?;
            DotCaller::new(server_name, parse_addr(addr, DOT_PORT)?, call_timeout, proxy)
                .map(Caller::Dot)
        } else if spec.starts_with("https://") {
            DohCaller::new(spec, call_timeout).map(Caller::Doh)
        } else {
            Ok(Caller::Udp(UdpCaller {
                addr: parse_addr(spec, DNS_PORT)?,
                timeout: call_timeout,
            }))
        }
    }

    pub async fn call(&self, request: &Message) -> Result<Message> {
        match self {
            Caller::Udp(c) => c.call(request).await,
            Caller::Tcp(c) => c.call(request).await,
            Caller::Dot(c) => c.call(request).await,
            Caller::Doh(c) => c.call(request).await,
        }
    }

    pub fn as_doh(&self) -> Option<&DohCaller> {
        match self {
            Caller::Doh(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Caller::Udp(c) => write!(f, "udp://{}", c.addr),
            Caller::Tcp(c) => write!(f, "tcp://{}", c.addr),
            Caller::Dot(c) => write!(f, "tls://{}@{}", c.server_name, c.addr),
            Caller::Doh(c) => write!(f, "{}", c.url),
        }
    }
}

fn parse_addr(s: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    bail!("invalid caller address: {s}")
}

pub struct UdpCaller {
    addr: SocketAddr,
    timeout: Duration,
}

impl UdpCaller {
    pub async fn call(&self, request: &Message) -> Result<Message> {
        let packet = proto::encode(request)?;
        let bind = if self.addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let sock = UdpSocket::bind(bind).await.context("bind udp socket")?;
        sock.connect(self.addr).await.context("connect upstream")?;
        sock.send(&packet).await.context("send query")?;

        let mut buf = [0u8; 4096];
        let raw = timeout(self.timeout, async {
            loop {
                let len = sock.recv(&mut buf).await?;
                // a connected socket only sees this upstream, but stray
                // packets with a foreign transaction id are still dropped
                if len >= 2 && buf[..2] == packet[..2] {
                    return Ok::<_, anyhow::Error>(buf[..len].to_vec());
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("udp query timeout"))??;

        Message::from_bytes(&raw).context("parse upstream response")
    }
}

pub struct TcpCaller {
    addr: SocketAddr,
    timeout: Duration,
    proxy: Option<Socks5Proxy>,
}

impl TcpCaller {
    pub async fn call(&self, request: &Message) -> Result<Message> {
        let packet = proto::encode(request)?;
        let stream = dial_tcp(self.addr, self.proxy.as_ref(), self.timeout).await?;
        let raw = exchange_framed(stream, &packet, self.timeout).await?;
        Message::from_bytes(&raw).context("parse upstream response")
    }
}

pub struct DotCaller {
    addr: SocketAddr,
    server_name: String,
    timeout: Duration,
    proxy: Option<Socks5Proxy>,
    tls: Arc<rustls::ClientConfig>,
}

impl DotCaller {
    pub fn new(
        server_name: &str,
        addr: SocketAddr,
        call_timeout: Duration,
        proxy: Option<Socks5Proxy>,
    ) -> Result<Self> {
        // Validate the SNI name up front so bad config fails at load
        rustls::ServerName::try_from(server_name)
            .with_context(|| format!("invalid dot server name: {server_name}"))?;
        Ok(Self {
            addr,
            server_name: server_name.to_string(),
            timeout: call_timeout,
            proxy,
            tls: tls_client_config()?,
        })
    }

    pub async fn call(&self, request: &Message) -> Result<Message> {
        let packet = proto::encode(request)?;
        let tcp = dial_tcp(self.addr, self.proxy.as_ref(), self.timeout).await?;
        let connector = TlsConnector::from(self.tls.clone());
        let server_name = rustls::ServerName::try_from(self.server_name.as_str())
            .context("invalid dot server name")?;
        let stream = timeout(self.timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| anyhow::anyhow!("dot tls handshake timeout"))?
            .context("dot tls handshake")?;
        let raw = exchange_framed(stream, &packet, self.timeout).await?;
        Message::from_bytes(&raw).context("parse upstream response")
    }
}

pub struct DohCaller {
    url: String,
    host: String,
    port: u16,
    timeout: Duration,
    client: ArcSwap<reqwest::Client>,
}

impl DohCaller {
    pub fn new(url: &str, call_timeout: Duration) -> Result<Self> {
        let rest = url
            .strip_prefix("https://")
            .with_context(|| format!("doh caller needs an https url: {url}"))?;
        let authority = rest.split('/').next().unwrap_or("");
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) => {
                (h.to_string(), p.parse::<u16>().context("doh port")?)
            }
            _ => (authority.to_string(), DOH_PORT),
        };
        if host.is_empty() {
            bail!("doh url has no host: {url}");
        }
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .context("build doh client")?;
        Ok(Self {
            url: url.to_string(),
            host,
            port,
            timeout: call_timeout,
            client: ArcSwap::from_pointee(client),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// One-shot bootstrap lookup of the DoH hostname through the system
    /// resolver; used only when no hosts entry pins it.
    pub async fn bootstrap(&self) -> Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("resolve doh host: {}", self.host))?;
        Ok(addrs.map(|sa| sa.ip()).collect())
    }

    /// Pin the resolved addresses into the HTTP client so later queries
    /// never recurse through DNS for the caller's own hostname.
    pub fn pin_servers(&self, ips: &[IpAddr]) -> Result<()> {
        let addrs: Vec<SocketAddr> = ips.iter().map(|ip| SocketAddr::new(*ip, self.port)).collect();
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .resolve_to_addrs(&self.host, &addrs)
            .build()
            .context("build pinned doh client")?;
        self.client.store(Arc::new(client));
        Ok(())
    }

    pub async fn call(&self, request: &Message) -> Result<Message> {
        let packet = proto::encode(request)?;
        let raw = if packet.len() <= DOH_GET_THRESHOLD {
            match self.query_get(&packet).await {
                Ok(raw) => raw,
                Err(err) => {
                    debug!(url = %self.url, error = %err, "doh get failed, trying post");
                    self.query_post(&packet).await?
                }
            }
        } else {
            self.query_post(&packet).await?
        };
        Message::from_bytes(&raw).context("parse doh response")
    }

    async fn query_get(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let url = format!("{}?dns={}", self.url, URL_SAFE_NO_PAD.encode(packet));
        let resp = self
            .client
            .load()
            .get(url)
            .header("Accept", "application/dns-message")
            .send()
            .await
            .context("doh get request")?;
        if !resp.status().is_success() {
            bail!("doh server returned {}", resp.status());
        }
        Ok(resp.bytes().await.context("read doh response")?.to_vec())
    }

    async fn query_post(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let resp = self
            .client
            .load()
            .post(&self.url)
            .header("Content-Type", "application/dns-message")
            .header("Accept", "application/dns-message")
            .body(packet.to_vec())
            .send()
            .await
            .context("doh post request")?;
        if !resp.status().is_success() {
            bail!("doh server returned {}", resp.status());
        }
        Ok(resp.bytes().await.context("read doh response")?.to_vec())
    }
}

fn tls_client_config() -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().context("load native certs")? {
        // skip roots the verifier cannot use rather than failing startup
        let _ = roots.add(&rustls::Certificate(cert.0));
    }
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

async fn dial_tcp(
    addr: SocketAddr,
    proxy: Option<&Socks5Proxy>,
    dial_timeout: Duration,
) -> Result<TcpStream> {
    match proxy {
        Some(proxy) => socks5_connect(proxy, addr, dial_timeout).await,
        None => timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow::anyhow!("tcp connect timeout"))?
            .context("tcp connect"),
    }
}

/// RFC 1928 CONNECT through `proxy` to `target`, with optional
/// username/password auth.
pub async fn socks5_connect(
    proxy: &Socks5Proxy,
    target: SocketAddr,
    dial_timeout: Duration,
) -> Result<TcpStream> {
    let mut stream = timeout(dial_timeout, TcpStream::connect(&proxy.server))
        .await
        .map_err(|_| anyhow::anyhow!("socks5 connect timeout"))?
        .context("connect socks5 proxy")?;

    timeout(dial_timeout, async {
        // method negotiation
        let methods: &[u8] = if proxy.username.is_some() {
            &[0x05, 0x01, 0x02]
        } else {
            &[0x05, 0x01, 0x00]
        };
        stream.write_all(methods).await?;
        let mut rsp = [0u8; 2];
        stream.read_exact(&mut rsp).await?;
        if rsp[0] != 0x05 {
            bail!("socks5: bad version");
        }
        if rsp[1] == 0x02 {
            let user = proxy.username.clone().unwrap_or_default();
            let pass = proxy.password.clone().unwrap_or_default();
            if user.len() > 255 || pass.len() > 255 {
                bail!("socks5: user/pass too long");
            }
            let mut buf = Vec::with_capacity(3 + user.len() + pass.len());
            buf.extend_from_slice(&[0x01, user.len() as u8]);
            buf.extend_from_slice(user.as_bytes());
            buf.push(pass.len() as u8);
            buf.extend_from_slice(pass.as_bytes());
            stream.write_all(&buf).await?;
            let mut auth = [0u8; 2];
            stream.read_exact(&mut auth).await?;
            if auth[1] != 0x00 {
                bail!("socks5: auth failed");
            }
        } else if rsp[1] != 0x00 {
            bail!("socks5: no acceptable method");
        }

        // CONNECT request
        let mut req = vec![0x05, 0x01, 0x00];
        match target.ip() {
            IpAddr::V4(v4) => {
                req.push(0x01);
                req.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                req.push(0x04);
                req.extend_from_slice(&v6.octets());
            }
        }
        req.extend_from_slice(&target.port().to_be_bytes());
        stream.write_all(&req).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[1] != 0x00 {
            bail!("socks5: connect rejected (rep={})", head[1]);
        }
        // drain the bound address
        match head[3] {
            0x01 => {
                let mut skip = [0u8; 6];
                stream.read_exact(&mut skip).await?;
            }
            0x04 => {
                let mut skip = [0u8; 18];
                stream.read_exact(&mut skip).await?;
            }
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut skip = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut skip).await?;
            }
            atyp => bail!("socks5: unknown bound address type {atyp}"),
        }
        Ok(stream)
    })
    .await
    .map_err(|_| anyhow::anyhow!("socks5 handshake timeout"))?
}

/// One DNS exchange over a length-prefixed stream (TCP and DoT framing).
async fn exchange_framed<S>(mut stream: S, packet: &[u8], io_timeout: Duration) -> Result<Vec<u8>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    timeout(io_timeout, async {
        let mut out = Vec::with_capacity(2 + packet.len());
        out.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        out.extend_from_slice(packet);
        stream.write_all(&out).await.context("write query frame")?;

        let mut len_buf = [0u8; 2];
        stream
            .read_exact(&mut len_buf)
            .await
            .context("read response length")?;
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_FRAME {
            bail!("bad response frame length: {frame_len}");
        }
        let mut buf = vec![0u8; frame_len];
        stream
            .read_exact(&mut buf)
            .await
            .context("read response body")?;
        Ok(buf)
    })
    .await
    .map_err(|_| anyhow::anyhow!("stream query timeout"))?
}
