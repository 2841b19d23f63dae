use std::{fmt::Display, sync::Arc};

use anyhow::{bail, Context};
use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    chain::Chain,
    diagnostics::RouterStatus,
    route::{ListenAddr, Target},
    router::Router,
};

const CONTENT_TYPE_HANDSHAKE: u8 = 22;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 1;
const EXTENSION_SERVER_NAME: u16 = 0;
const EXTENSION_SERVER_NAME_TYPE_HOSTNAME: u8 = 0;
const RECORD_HEADER_LENGTH: usize = 5;
const HTTPS_PORT: u16 = 443;

/// Routes TLS connections by the server name of their ClientHello, without
/// terminating them.
pub struct SniRouter {
    address: ListenAddr,
    chain: Arc<Chain>,
}

impl SniRouter {
    pub fn new(address: ListenAddr, chain: Arc<Chain>) -> Self {
        Self { address, chain }
    }
}

#[async_trait::async_trait]
impl Router for SniRouter {
    fn describe(&self) -> String {
        format!("sni://{}", self.address)
    }

    async fn serve(&self, status: &RouterStatus) -> anyhow::Result<()> {
        let listener = self.address.bind().await?;
        status.set_serving(true);
        log::info!("{} listening", self.describe());
        loop {
            let chain = self.chain.clone();
            let (stream, client_addr) = listener.accept().await?;
            tokio::spawn(async move {
                log::debug!("TLS connection accepted: {}", &client_addr);
                if let Err(error) = proxy(stream, &chain).await {
                    log::debug!("an error occurred in TLS connection; error = {:#}", error);
                };
            });
        }
    }
}

async fn proxy<S>(mut stream: S, chain: &Chain) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; RECORD_HEADER_LENGTH];
    stream.read_exact(&mut header).await?;
    validate(CONTENT_TYPE_HANDSHAKE, header[0], "content type")?;
    let message_length = u16::from_be_bytes([header[3], header[4]]);
    let mut message = vec![0u8; message_length.into()];
    stream.read_exact(&mut message).await?;

    let server_name = server_name(&message)?;
    log::debug!("TLS connect to \"{}\"", server_name);
    let mut upstream = chain.connect(&Target::new(server_name, HTTPS_PORT)).await?;
    upstream.write_all(&header).await?;
    upstream.write_all(&message).await?;
    upstream.flush().await?;
    tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
    Ok(())
}

/// Checked reads over a handshake message; running out of bytes is an
/// error instead of a panic.
trait HelloReader: Sized {
    fn next_u8(&mut self) -> anyhow::Result<u8>;
    fn next_u16(&mut self) -> anyhow::Result<u16>;
    fn next_u24(&mut self) -> anyhow::Result<u32>;
    fn next_bytes(&mut self, length: usize) -> anyhow::Result<Self>;
}

impl HelloReader for Bytes {
    fn next_u8(&mut self) -> anyhow::Result<u8> {
        self.next_bytes(1).map(|mut bytes| bytes.get_u8())
    }

    fn next_u16(&mut self) -> anyhow::Result<u16> {
        self.next_bytes(2).map(|mut bytes| bytes.get_u16())
    }

    fn next_u24(&mut self) -> anyhow::Result<u32> {
        let mut bytes = self.next_bytes(3)?;
        Ok(u32::from_be_bytes([0, bytes.get_u8(), bytes.get_u8(), bytes.get_u8()]))
    }

    fn next_bytes(&mut self, length: usize) -> anyhow::Result<Self> {
        if self.remaining() < length {
            bail!(
                "truncated ClientHello ({} bytes wanted, {} left)",
                length,
                self.remaining()
            );
        }
        Ok(self.split_to(length))
    }
}

/// Extracts the host name from a handshake message holding a ClientHello.
fn server_name(message: &[u8]) -> anyhow::Result<String> {
    let mut message = Bytes::copy_from_slice(message);
    validate(
        HANDSHAKE_TYPE_CLIENT_HELLO,
        message.next_u8()?,
        "handshake type",
    )?;
    let hello_length = message.next_u24()?;
    let mut hello = message.next_bytes(hello_length as usize)?;
    hello.next_bytes(2)?; // handshake version
    hello.next_bytes(32)?; // random
    let session_id_length = hello.next_u8()?;
    hello.next_bytes(session_id_length.into())?;
    let cipher_suites_length = hello.next_u16()?;
    hello.next_bytes(cipher_suites_length.into())?;
    let compression_methods_length = hello.next_u8()?;
    hello.next_bytes(compression_methods_length.into())?;
    if !hello.has_remaining() {
        bail!("no extensions in ClientHello; drop");
    }
    let extensions_length = hello.next_u16()?;
    let mut extensions = hello.next_bytes(extensions_length.into())?;
    while extensions.has_remaining() {
        let extension_type = extensions.next_u16()?;
        let extension_length = extensions.next_u16()?;
        let mut extension = extensions.next_bytes(extension_length.into())?;
        if extension_type != EXTENSION_SERVER_NAME {
            continue;
        }
        let list_length = extension.next_u16()?;
        let mut list = extension.next_bytes(list_length.into())?;
        while list.has_remaining() {
            let name_type = list.next_u8()?;
            let name_length = list.next_u16()?;
            let name = list.next_bytes(name_length.into())?;
            if name_type == EXTENSION_SERVER_NAME_TYPE_HOSTNAME {
                return String::from_utf8(name.to_vec()).context("server name is not valid UTF-8");
            }
        }
    }
    bail!("no server_name extension found; drop")
}

fn validate<T>(expect: T, actual: T, field_name: &str) -> anyhow::Result<()>
where
    T: Eq + Display,
{
    if expect == actual {
        Ok(())
    } else {
        let message = format!(
            "wrong TLS field \"{}\" value ({} expected, got {})",
            field_name, expect, actual
        );
        log::debug!("{}", &message);
        Err(anyhow::Error::msg(message))
    }
}
