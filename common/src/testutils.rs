use anyhow::Context;
use async_recursion::async_recursion;

pub async fn setup_test_dir() -> anyhow::Result<tempfile::TempDir> {
    // create a temporary directory
    let tmp_dir = tempfile::tempdir()?;
    // foo
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    //    |- 2.txt
    //    |- 3.txt
    // |- baz
    //    |- 4.txt
    //    |- qux
    //       |- 5.txt
    let foo_path = tmp_dir.path().join("foo");
    tokio::fs::create_dir(&foo_path).await?;
    tokio::fs::write(foo_path.join("0.txt"), "0").await?;
    let bar_path = foo_path.join("bar");
    tokio::fs::create_dir(&bar_path).await?;
    tokio::fs::write(bar_path.join("1.txt"), "1").await?;
    tokio::fs::write(bar_path.join("2.txt"), "2").await?;
    tokio::fs::write(bar_path.join("3.txt"), "3").await?;
    let baz_path = foo_path.join("baz");
    tokio::fs::create_dir(&baz_path).await?;
    tokio::fs::write(baz_path.join("4.txt"), "4").await?;
    let qux_path = baz_path.join("qux");
    tokio::fs::create_dir(&qux_path).await?;
    tokio::fs::write(qux_path.join("5.txt"), "5").await?;
    Ok(tmp_dir)
}

/// Check that `dst` holds exactly the entries of `src`, with identical file contents.
#[async_recursion]
pub async fn check_dirs_identical(
    src: &std::path::Path,
    dst: &std::path::Path,
) -> anyhow::Result<()> {
    let mut src_entries = tokio::fs::read_dir(src).await?;
    let mut src_count = 0;
    while let Some(src_entry) = src_entries.next_entry().await? {
        src_count += 1;
        let src_entry_path = src_entry.path();
        let dst_entry_path = dst.join(src_entry.file_name());
        let src_md = tokio::fs::symlink_metadata(&src_entry_path)
            .await
            .with_context(|| format!("Source file {:?} is missing!", &src_entry_path))?;
        let dst_md = tokio::fs::symlink_metadata(&dst_entry_path)
            .await
            .with_context(|| format!("Destination file {:?} is missing!", &dst_entry_path))?;
        assert_eq!(
            src_md.is_dir(),
            dst_md.is_dir(),
            "type mismatch for {dst_entry_path:?}"
        );
        if src_md.is_dir() {
            check_dirs_identical(&src_entry_path, &dst_entry_path).await?;
        } else {
            let src_contents = tokio::fs::read(&src_entry_path).await?;
            let dst_contents = tokio::fs::read(&dst_entry_path).await?;
            assert_eq!(src_contents, dst_contents, "contents differ: {dst_entry_path:?}");
        }
    }
    let mut dst_entries = tokio::fs::read_dir(dst).await?;
    let mut dst_count = 0;
    while dst_entries.next_entry().await?.is_some() {
        dst_count += 1;
    }
    assert_eq!(src_count, dst_count, "extra entries in {dst:?}");
    Ok(())
}
