use crate::engine::PolicyEngine;
use crate::protocol::{write_response, PolicyReader};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    /// One session on stdin/stdout, as spawned by the MTA
    Stdio,
    Tcp(String),
    Unix(PathBuf),
}

impl ListenAddress {
    pub fn parse(listen: Option<&str>) -> Self {
        match listen.map(str::trim) {
            None | Some("") | Some("-") => ListenAddress::Stdio,
            Some(addr) => match addr.strip_prefix("unix:") {
                Some(path) => ListenAddress::Unix(PathBuf::from(path)),
                None => ListenAddress::Tcp(addr.to_string()),
            },
        }
    }
}

/// Answer policy requests on one connection until the peer closes it.
/// Each request is fully decided and answered before the next is read.
pub async fn serve_connection<R, W>(
    engine: &PolicyEngine,
    reader: R,
    mut writer: W,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = PolicyReader::new(BufReader::new(reader));
    while let Some(request) = reader.next_request().await? {
        let action = engine.evaluate(&request).await;
        write_response(&mut writer, &action).await?;
    }
    log::debug!("Policy client closed the connection");
    Ok(())
}

pub async fn run(engine: Arc<PolicyEngine>, listen: &ListenAddress) -> anyhow::Result<()> {
    match listen {
        ListenAddress::Stdio => {
            log::info!("Serving policy requests on stdin/stdout");
            serve_connection(&engine, tokio::io::stdin(), tokio::io::stdout()).await?;
            Ok(())
        }
        ListenAddress::Tcp(addr) => {
            let listener = TcpListener::bind(addr).await?;
            log::info!("Starting policy service on: {addr}");
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, peer) = accepted?;
                        log::debug!("Connection from: {peer}");
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            let (reader, writer) = stream.into_split();
                            if let Err(e) = serve_connection(&engine, reader, writer).await {
                                log::warn!("Policy connection from {peer} failed: {e}");
                            }
                        });
                    }
                    _ = tokio::signal::ctrl_c() => {
                        log::info!("Received shutdown signal, stopping");
                        return Ok(());
                    }
                }
            }
        }
        #[cfg(unix)]
        ListenAddress::Unix(path) => {
            use tokio::net::UnixListener;

            // Remove existing socket if it exists
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            let listener = UnixListener::bind(path)?;
            log::info!("Starting policy service on: unix:{}", path.display());
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, _) = accepted?;
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            let (reader, writer) = stream.into_split();
                            if let Err(e) = serve_connection(&engine, reader, writer).await {
                                log::warn!("Policy connection failed: {e}");
                            }
                        });
                    }
                    _ = tokio::signal::ctrl_c() => {
                        log::info!("Received shutdown signal, stopping");
                        if let Err(e) = std::fs::remove_file(path) {
                            log::warn!("Failed to remove socket {}: {e}", path.display());
                        }
                        return Ok(());
                    }
                }
            }
        }
        #[cfg(not(unix))]
        ListenAddress::Unix(path) => {
            anyhow::bail!("Unix sockets are not supported here: {}", path.display())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::handlers::testing::ScriptedResolver;
    use crate::spf::{Scope, SpfCode};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_listen_address() {
        assert_eq!(ListenAddress::parse(None), ListenAddress::Stdio);
        assert_eq!(ListenAddress::parse(Some("-")), ListenAddress::Stdio);
        assert_eq!(
            ListenAddress::parse(Some("127.0.0.1:10023")),
            ListenAddress::Tcp("127.0.0.1:10023".to_string())
        );
        assert_eq!(
            ListenAddress::parse(Some("unix:/var/run/spf-policyd.sock")),
            ListenAddress::Unix(PathBuf::from("/var/run/spf-policyd.sock"))
        );
    }

    #[tokio::test]
    async fn test_session_over_stream() {
        let resolver = Arc::new(
            ScriptedResolver::new()
                .with(Scope::Helo, SpfCode::Pass)
                .with(Scope::MailFrom, SpfCode::Fail),
        );
        let config = Config {
            trusted_relays: vec!["10.0.0.0/8".to_string()],
            ..Default::default()
        };
        let engine = PolicyEngine::with_resolver(&config, resolver).unwrap();

        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let session =
            tokio::spawn(async move { serve_connection(&engine, server_read, server_write).await });

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write
            .write_all(
                b"request=smtpd_access_policy\n\
                  client_address=192.0.2.1\n\
                  helo_name=mail.example.com\n\
                  sender=user@example.com\n\
                  recipient=a@x.example\n\
                  instance=A1\n\
                  \n\
                  this line is noise\n\
                  client_address=10.0.0.5\n\
                  helo_name=relay.example.com\n\
                  sender=user@example.com\n\
                  \n",
            )
            .await
            .unwrap();
        client_write.shutdown().await.unwrap();
        drop(client_write);

        let mut output = String::new();
        client_read.read_to_string(&mut output).await.unwrap();
        session.await.unwrap().unwrap();

        assert_eq!(
            output,
            "action=550 Forbidden\n\naction=PREPEND X-Comment: SPF skipped for whitelisted relay - skipped check\n\n"
        );
    }

    #[tokio::test]
    async fn test_invalid_utf8_still_answers_every_block() {
        let resolver = Arc::new(ScriptedResolver::new().with(Scope::Helo, SpfCode::Pass));
        let engine = PolicyEngine::with_resolver(&Config::default(), resolver).unwrap();

        let input: &[u8] = b"client_address=192.0.2.1\n\
              helo_name=mail.example.com\n\
              sender=\n\
              ccert_subject=caf\xe9\n\
              \n\
              client_address=127.0.0.1\n\
              helo_name=localhost.example.com\n\
              \n";
        let mut output = Vec::new();
        serve_connection(&engine, input, &mut output).await.unwrap();

        let output = String::from_utf8(output).unwrap();
        let actions: Vec<&str> = output.split("\n\n").filter(|s| !s.is_empty()).collect();
        assert_eq!(actions.len(), 2);
        assert!(actions[0].starts_with("action=PREPEND Received-SPF: Pass"));
        assert_eq!(
            actions[1],
            "action=PREPEND X-Comment: SPF not applicable to localhost connection - skipped check"
        );
    }
}
