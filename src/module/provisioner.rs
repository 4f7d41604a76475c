//! 依赖安装
//!
//! 按声明顺序逐个安装模块依赖，遇到第一个失败即停止。已安装的依赖不回滚。
//! 安装器通过 [`PackageInstaller`] 注入，测试中可替换为假实现。

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::ProvisioningConfig;
use crate::module::metadata::DependencySpec;
use crate::utils::{CoreError, Result};

/// 外部包安装能力
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// 安装单个依赖
    ///
    /// 失败时返回安装器的诊断输出。
    async fn install(&self, spec: &str) -> std::result::Result<(), String>;
}

/// 通过外部命令安装，依赖声明作为最后一个参数
///
/// 默认命令为 `pip install <spec>`。
pub struct CommandInstaller {
    program: String,
    args: Vec<String>,
}

impl CommandInstaller {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// 从命令行数组创建（第一个元素为程序）
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv.split_first().ok_or_else(|| CoreError::InvalidConfigValue {
            key: "provisioning.installer".to_string(),
            reason: "安装器命令不能为空".to_string(),
        })?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }
}

impl Default for CommandInstaller {
    fn default() -> Self {
        Self::new("pip", vec!["install".to_string()])
    }
}

#[async_trait]
impl PackageInstaller for CommandInstaller {
    async fn install(&self, spec: &str) -> std::result::Result<(), String> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(spec)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // 超时或取消时丢弃 future 即终止安装进程
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("无法启动安装器 '{}': {}", self.program, e))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let diagnostic = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            Err(format!("{} ({})", diagnostic, output.status))
        }
    }
}

/// 依赖安装器
pub struct DependencyProvisioner {
    installer: Arc<dyn PackageInstaller>,
    timeout: Duration,
    // 为 Some 时整个宿主范围内串行安装
    serial: Option<Mutex<()>>,
}

impl DependencyProvisioner {
    pub fn new(installer: Arc<dyn PackageInstaller>, timeout: Duration) -> Self {
        Self {
            installer,
            timeout,
            serial: None,
        }
    }

    /// 根据配置创建，使用外部命令安装器
    pub fn from_config(config: &ProvisioningConfig) -> Result<Self> {
        let installer = CommandInstaller::from_argv(&config.installer)?;
        let provisioner = Self::new(Arc::new(installer), Duration::from_secs(config.timeout_secs));
        Ok(if config.serialize {
            provisioner.serialized()
        } else {
            provisioner
        })
    }

    /// 多个模块的安装互斥执行
    pub fn serialized(mut self) -> Self {
        self.serial = Some(Mutex::new(()));
        self
    }

    /// 单个依赖的超时
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 按顺序安装依赖列表
    ///
    /// # Errors
    ///
    /// - `ProvisionError`：某个依赖安装失败或超时，携带失败的依赖与诊断信息
    /// - `Cancelled`：安装过程中被取消
    pub async fn install(
        &self,
        deps: &[DependencySpec],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if deps.is_empty() {
            return Ok(());
        }

        let _serial = match self.serial {
            Some(ref lock) => Some(tokio::select! {
                guard = lock.lock() => guard,
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
            }),
            None => None,
        };

        for spec in deps {
            debug!(dependency = %spec, "开始安装依赖");

            let outcome = tokio::select! {
                result = tokio::time::timeout(self.timeout, self.installer.install(spec)) => result,
                _ = cancel.cancelled() => {
                    warn!(dependency = %spec, "依赖安装被取消");
                    return Err(CoreError::Cancelled);
                }
            };

            match outcome {
                Ok(Ok(())) => info!(dependency = %spec, "依赖安装完成"),
                Ok(Err(diagnostic)) => {
                    warn!(dependency = %spec, diagnostic = %diagnostic, "依赖安装失败");
                    return Err(CoreError::ProvisionError {
                        spec: spec.clone(),
                        diagnostic,
                    });
                }
                Err(_) => {
                    warn!(dependency = %spec, timeout = ?self.timeout, "依赖安装超时");
                    return Err(CoreError::ProvisionError {
                        spec: spec.clone(),
                        diagnostic: format!("安装超时（{} 秒）", self.timeout.as_secs()),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// 记录调用顺序的假安装器
    #[derive(Default)]
    struct FakeInstaller {
        calls: StdMutex<Vec<String>>,
        fail_on: Option<String>,
        hang_on: Option<String>,
    }

    #[async_trait]
    impl PackageInstaller for FakeInstaller {
        async fn install(&self, spec: &str) -> std::result::Result<(), String> {
            self.calls.lock().unwrap().push(spec.to_string());
            if self.hang_on.as_deref() == Some(spec) {
                futures::future::pending::<()>().await;
            }
            if self.fail_on.as_deref() == Some(spec) {
                return Err(format!("no matching distribution for {}", spec));
            }
            Ok(())
        }
    }

    fn specs(items: &[&str]) -> Vec<DependencySpec> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_installs_in_order() {
        let installer = Arc::new(FakeInstaller::default());
        let provisioner = DependencyProvisioner::new(installer.clone(), Duration::from_secs(5));

        provisioner
            .install(&specs(&["a", "b", "c"]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(*installer.calls.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let installer = Arc::new(FakeInstaller {
            fail_on: Some("b".to_string()),
            ..Default::default()
        });
        let provisioner = DependencyProvisioner::new(installer.clone(), Duration::from_secs(5));

        let err = provisioner
            .install(&specs(&["a", "b", "c"]), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            CoreError::ProvisionError { spec, diagnostic } => {
                assert_eq!(spec, "b");
                assert!(diagnostic.contains("no matching distribution"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(*installer.calls.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_provision_error() {
        let installer = Arc::new(FakeInstaller {
            hang_on: Some("slow".to_string()),
            ..Default::default()
        });
        let provisioner = DependencyProvisioner::new(installer, Duration::from_secs(300));

        let err = provisioner
            .install(&specs(&["slow"]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ProvisionError { ref spec, .. } if spec == "slow"));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let installer = Arc::new(FakeInstaller {
            hang_on: Some("slow".to_string()),
            ..Default::default()
        });
        let provisioner = DependencyProvisioner::new(installer, Duration::from_secs(300));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = provisioner
            .install(&specs(&["slow"]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }

    #[tokio::test]
    async fn test_empty_list_is_noop() {
        let provisioner = DependencyProvisioner::new(
            Arc::new(FakeInstaller::default()),
            Duration::from_secs(1),
        )
        .serialized();
        provisioner
            .install(&[], &CancellationToken::new())
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_installer_reports_failure() {
        let installer = CommandInstaller::new(
            "sh",
            vec![
                "-c".to_string(),
                "echo broken >&2; exit 3".to_string(),
                "sh".to_string(),
            ],
        );
        let diagnostic = installer.install("pkg").await.unwrap_err();
        assert!(diagnostic.contains("broken"));
    }

    #[test]
    fn test_from_argv_rejects_empty() {
        assert!(CommandInstaller::from_argv(&[]).is_err());
    }
}
