use hostgate_types::LockHash;
use std::path::Path;
use tokio::io::AsyncReadExt;

const CHUNK_SIZE: usize = 64 * 1024;

/// MD5 digest of a lock file, read in chunks
pub async fn lock_file_digest(path: &Path) -> std::io::Result<LockHash> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }

    Ok(LockHash::md5(format!("{:x}", context.compute())))
}
