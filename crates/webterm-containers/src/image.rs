use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::ContainerResult;

/// Build-context recipe for the SSH image: a minimal Debian with sshd,
/// root login over password enabled, PAM off, daemon in the foreground.
/// The root password is provisioned at build time from configuration.
pub fn dockerfile(root_password: &str) -> String {
    format!(
        r#"FROM debian:bookworm-slim

RUN apt-get update \
    && apt-get install -y --no-install-recommends openssh-server \
    && rm -rf /var/lib/apt/lists/*

RUN mkdir -p /var/run/sshd \
    && echo 'root:{root_password}' | chpasswd \
    && sed -i 's/#PermitRootLogin prohibit-password/PermitRootLogin yes/' /etc/ssh/sshd_config \
    && sed -i 's/UsePAM yes/UsePAM no/' /etc/ssh/sshd_config

EXPOSE 22

CMD ["/usr/sbin/sshd", "-D"]
"#
    )
}

/// Write the build context to `dir`, returning the directory path to hand
/// to the runtime's build command.
pub async fn write_build_context(dir: &Path, root_password: &str) -> ContainerResult<PathBuf> {
    fs::create_dir_all(dir).await?;
    fs::write(dir.join("Dockerfile"), dockerfile(root_password)).await?;
    Ok(dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipe_provisions_root_login() {
        let text = dockerfile("s3cret");
        assert!(text.contains("openssh-server"));
        assert!(text.contains("root:s3cret"));
        assert!(text.contains("PermitRootLogin yes"));
        assert!(text.contains("UsePAM no"));
        assert!(text.contains("EXPOSE 22"));
        assert!(text.contains(r#"CMD ["/usr/sbin/sshd", "-D"]"#));
    }

    #[tokio::test]
    async fn writes_context_dir() {
        let dir = std::env::temp_dir().join(format!("webterm-image-test-{}", std::process::id()));
        let context = write_build_context(&dir, "pw").await.unwrap();
        let written = fs::read_to_string(context.join("Dockerfile")).await.unwrap();
        assert!(written.contains("root:pw"));
        let _ = fs::remove_dir_all(&dir).await;
    }
}
