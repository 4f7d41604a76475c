//! 提案令牌生成
//!
//! 冲突提案使用 10 位 62 进制令牌（0-9, a-z, A-Z），便于运维在命令行中
//! 原样输入 `confirm <token>`。

use rand::Rng;

/// 62 进制字符集
const BASE62_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// 令牌长度
pub const TOKEN_LENGTH: usize = 10;

/// 生成 10 位 62 进制令牌
///
/// ```
/// use modhost::utils::id::generate_token;
///
/// let token = generate_token();
/// assert_eq!(token.len(), 10);
/// ```
pub fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LENGTH)
        .map(|_| BASE62_CHARS[rng.gen_range(0..BASE62_CHARS.len())] as char)
        .collect()
}

/// 验证令牌格式是否有效
///
/// ```
/// use modhost::utils::id::is_valid_token;
///
/// assert!(is_valid_token("a1B2c3D4e5"));
/// assert!(!is_valid_token("too-short"));
/// ```
pub fn is_valid_token(token: &str) -> bool {
    token.len() == TOKEN_LENGTH && token.chars().all(|c| c.is_ascii_alphanumeric())
}
