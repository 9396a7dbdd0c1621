//! SSH-backed remote copy. Transfers run over SFTP on one authenticated
//! session; every socket operation is bounded by the configured timeout.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use ssh2::{FileStat, Session, Sftp};

use crate::config::SshConfig;
use crate::error::{DumperError, Result};
use crate::retrieval::{create_dir_level, report_progress, ProgressFn, RemoteCopy};

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Clone)]
pub struct SshRemote {
    session: Session,
    endpoint: String,
}

impl SshRemote {
    pub fn connect(cfg: &SshConfig, timeout: Duration) -> Result<Self> {
        let connect_err = |source: anyhow::Error| DumperError::SshConnect {
            host: cfg.host.clone(),
            port: cfg.port,
            source,
        };

        let tcp = open_stream(&cfg.host, cfg.port, timeout).map_err(connect_err)?;
        let mut session = Session::new()
            .context("create ssh session")
            .map_err(connect_err)?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        session
            .handshake()
            .context("ssh handshake")
            .map_err(connect_err)?;

        authenticate(&session, cfg)?;

        let endpoint = format!("{}@{}:{}", cfg.user, cfg.host, cfg.port);
        tracing::info!(%endpoint, "ssh session established");
        Ok(Self { session, endpoint })
    }

    pub fn close(&self) {
        if let Err(err) = self.session.disconnect(None, "dump finished", None) {
            tracing::debug!(endpoint = %self.endpoint, "ssh disconnect: {err}");
        }
    }

    fn pull_file(
        &self,
        sftp: &Sftp,
        remote: &Path,
        stat: &FileStat,
        dest: &Path,
        progress: &mut ProgressFn<'_>,
    ) -> anyhow::Result<()> {
        let name = remote.to_string_lossy();
        let size = stat.size.unwrap_or(0);
        let mut source = sftp
            .open(remote)
            .with_context(|| format!("open remote {name}"))?;
        let mut target = File::create(dest).with_context(|| format!("create {}", dest.display()))?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut sent = 0u64;
        report_progress(progress, &name, size, sent)?;
        loop {
            let read = source
                .read(&mut buffer)
                .with_context(|| format!("read remote {name}"))?;
            if read == 0 {
                break;
            }
            target.write_all(&buffer[..read])?;
            sent += read as u64;
            if sent < size {
                report_progress(progress, &name, size, sent)?;
            }
        }
        report_progress(progress, &name, sent.max(size), sent.max(size))?;

        if let Some(perm) = stat.perm {
            fs::set_permissions(dest, fs::Permissions::from_mode(perm & 0o7777))?;
        }
        Ok(())
    }

    fn pull_tree(
        &self,
        sftp: &Sftp,
        remote: &Path,
        dest: &Path,
        progress: &mut ProgressFn<'_>,
    ) -> anyhow::Result<()> {
        create_dir_level(dest).with_context(|| format!("create {}", dest.display()))?;
        let entries = sftp
            .readdir(remote)
            .with_context(|| format!("list remote {}", remote.display()))?;

        for (path, stat) in entries {
            let Some(name) = path.file_name() else {
                continue;
            };
            let local = dest.join(name);
            if stat.file_type().is_symlink() {
                let link = sftp
                    .readlink(&path)
                    .with_context(|| format!("readlink {}", path.display()))?;
                std::os::unix::fs::symlink(&link, &local)
                    .with_context(|| format!("symlink {}", local.display()))?;
            } else if stat.is_dir() {
                self.pull_tree(sftp, &path, &local, progress)?;
            } else {
                self.pull_file(sftp, &path, &stat, &local, progress)?;
            }
        }
        Ok(())
    }
}

impl RemoteCopy for SshRemote {
    fn fetch(
        &self,
        remote: &str,
        local_dir: &Path,
        recursive: bool,
        progress: &mut ProgressFn<'_>,
    ) -> anyhow::Result<()> {
        let remote_path = PathBuf::from(remote);
        let name = remote_path
            .file_name()
            .ok_or_else(|| anyhow!("remote path {remote} has no file name"))?;
        let dest = local_dir.join(name);

        let sftp = self.session.sftp().context("open sftp channel")?;
        let stat = sftp
            .stat(&remote_path)
            .with_context(|| format!("stat remote {remote}"))?;

        if stat.is_dir() {
            if !recursive {
                bail!("{remote}: not a regular file");
            }
            self.pull_tree(&sftp, &remote_path, &dest, progress)?;
            if let Some(perm) = stat.perm {
                fs::set_permissions(&dest, fs::Permissions::from_mode(perm & 0o7777))?;
            }
            Ok(())
        } else {
            self.pull_file(&sftp, &remote_path, &stat, &dest, progress)
        }
    }
}

fn open_stream(host: &str, port: u16, timeout: Duration) -> anyhow::Result<TcpStream> {
    let addrs = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolve {host}:{port}"))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(anyhow!(err).context(format!("connect {addr}"))),
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("no address found for {host}:{port}")))
}

/// Key file first when given, then the password.
fn authenticate(session: &Session, cfg: &SshConfig) -> Result<()> {
    let mut reasons = Vec::new();

    if let Some(key) = cfg.key_filename.as_deref() {
        match session.userauth_pubkey_file(&cfg.user, None, key, cfg.password.as_deref()) {
            Ok(()) if session.authenticated() => return Ok(()),
            Ok(()) => reasons.push(format!("key {} not accepted", key.display())),
            Err(err) => reasons.push(format!("key {}: {err}", key.display())),
        }
    }

    if let Some(password) = cfg.password.as_deref() {
        match session.userauth_password(&cfg.user, password) {
            Ok(()) if session.authenticated() => return Ok(()),
            Ok(()) => reasons.push("password not accepted".to_string()),
            Err(err) => reasons.push(format!("password: {err}")),
        }
    }

    if reasons.is_empty() {
        reasons.push("no key file or password configured".to_string());
    }
    Err(DumperError::SshAuth {
        user: cfg.user.clone(),
        reason: reasons.join("; "),
    })
}
