use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

/// Build the TLS acceptor from PEM files. Both paths or neither; neither means plaintext.
pub fn load_tls_acceptor(
    cert_path: Option<&Path>,
    key_path: Option<&Path>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both KINEDESK_TLS_CERT and KINEDESK_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(open(cert_path)?))
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates found in {}", cert_path.display()),
        ));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(open(key_path)?))?.ok_or_else(|| {
        io::Error::new(
            ErrorKind::InvalidInput,
            format!("no private key found in {}", key_path.display()),
        )
    })?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

fn open(path: &Path) -> io::Result<File> {
    File::open(path).map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))
}
