//! Small unix helpers shared by the TCP-serving daemons.

use std::io;

use nix::unistd::{setgid, setgroups, setuid, Gid, Uid, User};

/// Drop root privileges to `user` after binding a privileged port. A no-op
/// when not running as root.
pub fn drop_privileges(user: &str) -> io::Result<()> {
    if !Uid::effective().is_root() {
        return Ok(());
    }
    let pw = User::from_name(user)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such user {user}")))?;
    setgroups(&[]).map_err(io::Error::from)?;
    setgid(Gid::from_raw(pw.gid.as_raw())).map_err(io::Error::from)?;
    setuid(Uid::from_raw(pw.uid.as_raw())).map_err(io::Error::from)?;
    Ok(())
}
