//! Optional TLS for the wire listener.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::Config;

/// Build the acceptor from `BOOKD_TLS_CERT` / `BOOKD_TLS_KEY`. `Ok(None)`
/// when TLS is not configured; `Config` already rejects a lone cert or key.
pub fn acceptor_from_config(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (Some(cert), Some(key)) => load_acceptor(Path::new(cert), Path::new(key)).map(Some),
        _ => Ok(None),
    }
}

pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> io::Result<TlsAcceptor> {
    let certs = read_certs(cert_path)?;
    let key = read_key(key_path)?;

    let mut server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    server.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(server)))
}

fn open(path: &Path) -> io::Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))
}

fn read_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut open(path)?).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("{}: no certificates found", path.display()),
        ));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)?.ok_or_else(|| {
        io::Error::new(
            ErrorKind::InvalidInput,
            format!("{}: no private key found", path.display()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_file(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bookd_test_tls");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn config_with(cert: Option<&str>, key: Option<&str>) -> Config {
        let mut env = vec![
            ("BOOKD_USER_SERVICE_URL", "http://users".to_string()),
            ("BOOKD_LISTING_SERVICE_URL", "http://listings".to_string()),
        ];
        if let Some(c) = cert {
            env.push(("BOOKD_TLS_CERT", c.to_string()));
        }
        if let Some(k) = key {
            env.push(("BOOKD_TLS_KEY", k.to_string()));
        }
        Config::from_lookup(|key| env.iter().find(|(k, _)| *k == key).map(|(_, v)| v.clone())).unwrap()
    }

    #[test]
    fn disabled_without_paths() {
        assert!(acceptor_from_config(&config_with(None, None)).unwrap().is_none());
    }

    #[test]
    fn missing_file_names_the_path() {
        let config = config_with(Some("/nonexistent/bookd.crt"), Some("/nonexistent/bookd.key"));
        let err = acceptor_from_config(&config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("/nonexistent/bookd.crt"));
    }

    #[test]
    fn empty_pem_is_rejected() {
        let cert = scratch_file("empty.crt", "");
        let key = scratch_file("empty.key", "");
        let err = load_acceptor(&cert, &key).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.to_string().contains("no certificates"));
    }
}
