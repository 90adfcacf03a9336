use std::io::{Cursor, SeekFrom};

use ps2mc_fs::{DirMode, Error, FormatParams, McFs, OpenMode};

type MemFs = McFs<Cursor<Vec<u8>>>;

fn fresh(clusters: u32) -> MemFs {
    let params = FormatParams::with_clusters(clusters);
    McFs::format(Cursor::new(Vec::new()), &params).unwrap()
}

fn write_file(fs: &mut MemFs, path: &[u8], data: &[u8]) {
    let mut f = fs.open_file(path, OpenMode::Write).unwrap();
    f.write(fs, data).unwrap();
    f.close(fs).unwrap();
}

fn read_file(fs: &mut MemFs, path: &[u8]) -> Vec<u8> {
    let mut f = fs.open_file(path, OpenMode::Read).unwrap();
    let data = f.read_to_end(fs).unwrap();
    f.close(fs).unwrap();
    data
}

#[test]
fn format_then_check() {
    let mut fs = fresh(1024);
    assert!(fs.check().unwrap());
}

#[test]
fn format_then_mkdir_then_check() {
    let mut fs = fresh(1024);
    fs.mkdir(b"/A").unwrap();
    assert!(fs.check().unwrap());
}

#[test]
fn standard_card_free_space() {
    // 8192 clusters: 2 superblock + 1 indirect + 32 FAT clusters reserved
    // up front, 16 clusters of backup blocks at the end, one root cluster.
    let mut fs = fresh(8192);
    assert_eq!(fs.get_free_space().unwrap(), 8140 * 1024);
}

#[test]
fn small_card_free_space() {
    let mut fs = fresh(1024);
    // 1024 clusters: 2 + 1 + 4 reserved, 16 backup, 1 root.
    assert_eq!(fs.get_free_space().unwrap(), 1000 * 1024);
}

#[test]
fn write_read_round_trip_sizes() {
    let cs = 1024usize;
    for n in [0, 1, cs - 1, cs, cs + 1, 10 * cs] {
        let mut fs = fresh(1024);
        let data: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
        write_file(&mut fs, b"/DATA", &data);
        assert_eq!(read_file(&mut fs, b"/DATA"), data, "size {n}");
        assert!(fs.check().unwrap(), "size {n}");
    }
}

#[test]
fn reads_span_cluster_boundaries() {
    let mut fs = fresh(1024);
    let data: Vec<u8> = (0..5000).map(|i| (i % 241) as u8).collect();
    write_file(&mut fs, b"/DATA", &data);

    let mut f = fs.open_file(b"/DATA", OpenMode::Read).unwrap();
    f.seek(SeekFrom::Start(1000)).unwrap();
    let mut buf = vec![0u8; 2048];
    let n = f.read(&mut fs, &mut buf).unwrap();
    assert_eq!(n, 2048);
    assert_eq!(buf, data[1000..3048]);
    f.close(&mut fs).unwrap();
}

#[test]
fn open_write_truncates() {
    let mut fs = fresh(1024);
    write_file(&mut fs, b"/DATA", &[0xAA; 5000]);
    let before = fs.get_free_space().unwrap();
    write_file(&mut fs, b"/DATA", b"short");
    assert_eq!(read_file(&mut fs, b"/DATA"), b"short");
    // Five clusters shrank to one.
    assert_eq!(fs.get_free_space().unwrap(), before + 4 * 1024);
    assert!(fs.check().unwrap());
}

#[test]
fn seek_past_end_zero_fills() {
    let mut fs = fresh(1024);
    let mut f = fs.open_file(b"/SPARSE", OpenMode::Write).unwrap();
    f.write(&mut fs, b"head").unwrap();
    f.seek(SeekFrom::Start(3000)).unwrap();
    f.write(&mut fs, b"tail").unwrap();
    f.close(&mut fs).unwrap();

    let data = read_file(&mut fs, b"/SPARSE");
    assert_eq!(data.len(), 3004);
    assert_eq!(&data[..4], b"head");
    assert!(data[4..3000].iter().all(|&b| b == 0));
    assert_eq!(&data[3000..], b"tail");
    assert!(fs.check().unwrap());
}

#[test]
fn append_mode_continues_at_the_end() {
    let mut fs = fresh(1024);
    write_file(&mut fs, b"/LOG", b"one");
    let mut f = fs.open_file(b"/LOG", OpenMode::Append).unwrap();
    f.write(&mut fs, b"two").unwrap();
    f.close(&mut fs).unwrap();
    assert_eq!(read_file(&mut fs, b"/LOG"), b"onetwo");
}

#[test]
fn closed_handles_reject_everything() {
    let mut fs = fresh(1024);
    let mut f = fs.open_file(b"/DATA", OpenMode::Write).unwrap();
    f.write(&mut fs, b"x").unwrap();
    f.close(&mut fs).unwrap();
    assert!(matches!(f.read(&mut fs, &mut [0; 4]), Err(Error::BadHandle)));
    assert!(matches!(f.write(&mut fs, b"y"), Err(Error::BadHandle)));
    assert!(matches!(f.seek(SeekFrom::Start(0)), Err(Error::BadHandle)));
    assert!(matches!(f.close(&mut fs), Err(Error::BadHandle)));
}

#[test]
fn open_errors() {
    let mut fs = fresh(1024);
    fs.mkdir(b"/DIR").unwrap();
    assert!(matches!(
        fs.open_file(b"/MISSING", OpenMode::Read),
        Err(Error::NotFound { .. })
    ));
    assert!(matches!(
        fs.open_file(b"/DIR", OpenMode::Read),
        Err(Error::IsDirectory { .. })
    ));
    assert!(matches!(
        fs.open_file(b"/DIR", OpenMode::Write),
        Err(Error::IsDirectory { .. })
    ));
    assert!(matches!(
        fs.mkdir(b"/DIR"),
        Err(Error::Exists { .. })
    ));
}

#[test]
fn directory_slots_grow_and_get_reused() {
    let mut fs = fresh(1024);
    fs.mkdir(b"/SAVE").unwrap();
    write_file(&mut fs, b"/SAVE/ONE", b"1");
    write_file(&mut fs, b"/SAVE/TWO", b"2");
    write_file(&mut fs, b"/SAVE/THREE", b"3");
    assert_eq!(fs.get_dirent(b"/SAVE").unwrap().length, 5);

    fs.remove(b"/SAVE/TWO").unwrap();
    // The slot count includes the tombstone.
    assert_eq!(fs.get_dirent(b"/SAVE").unwrap().length, 5);
    let live = fs
        .read_dir(b"/SAVE")
        .unwrap()
        .iter()
        .filter(|e| e.mode.is_live())
        .count();
    assert_eq!(live, 4); // ".", "..", ONE, THREE

    // A new file reuses the tombstone instead of growing the directory.
    write_file(&mut fs, b"/SAVE/FOUR", b"4");
    assert_eq!(fs.get_dirent(b"/SAVE").unwrap().length, 5);
    write_file(&mut fs, b"/SAVE/FIVE", b"5");
    assert_eq!(fs.get_dirent(b"/SAVE").unwrap().length, 6);
    assert!(fs.check().unwrap());
}

#[test]
fn directories_span_multiple_clusters() {
    let mut fs = fresh(1024);
    fs.mkdir(b"/BIG").unwrap();
    for i in 0..20 {
        write_file(&mut fs, format!("/BIG/FILE{i:02}").as_bytes(), b"x");
    }
    assert_eq!(fs.get_dirent(b"/BIG").unwrap().length, 22);
    assert_eq!(read_file(&mut fs, b"/BIG/FILE19"), b"x");
    assert!(fs.check().unwrap());
}

#[test]
fn remove_semantics() {
    let mut fs = fresh(1024);
    fs.mkdir(b"/DIR").unwrap();
    write_file(&mut fs, b"/DIR/FILE", b"data");
    assert!(matches!(
        fs.remove(b"/DIR"),
        Err(Error::NotEmpty { .. })
    ));
    fs.remove(b"/DIR/FILE").unwrap();
    fs.remove(b"/DIR").unwrap();
    assert!(matches!(
        fs.get_dirent(b"/DIR"),
        Err(Error::NotFound { .. })
    ));
    assert!(fs.check().unwrap());
}

#[test]
fn recursive_delete_frees_everything() {
    let mut fs = fresh(1024);
    let free = fs.get_free_space().unwrap();
    fs.mkdir(b"/SAVE").unwrap();
    fs.mkdir(b"/SAVE/NESTED").unwrap();
    write_file(&mut fs, b"/SAVE/A", &[1; 3000]);
    write_file(&mut fs, b"/SAVE/NESTED/B", &[2; 1500]);
    fs.rmdir_recursive(b"/SAVE").unwrap();
    assert_eq!(fs.get_free_space().unwrap(), free);
    assert!(fs.check().unwrap());
}

#[test]
fn rename_same_directory_only() {
    let mut fs = fresh(1024);
    fs.mkdir(b"/A").unwrap();
    fs.mkdir(b"/B").unwrap();
    write_file(&mut fs, b"/A/OLD", b"data");
    let free = fs.get_free_space().unwrap();

    fs.rename(b"/A/OLD", b"/A/NEW").unwrap();
    assert_eq!(read_file(&mut fs, b"/A/NEW"), b"data");
    assert!(matches!(
        fs.get_dirent(b"/A/OLD"),
        Err(Error::NotFound { .. })
    ));
    assert_eq!(fs.get_free_space().unwrap(), free);

    assert!(matches!(
        fs.rename(b"/A/NEW", b"/B/NEW"),
        Err(Error::InvalidArg(_))
    ));
    fs.rename(b"/B", b"/C").unwrap();
    assert!(fs.check().unwrap());
}

#[test]
fn chdir_and_relative_paths() {
    let mut fs = fresh(1024);
    fs.mkdir(b"/A").unwrap();
    fs.mkdir(b"/A/B").unwrap();
    write_file(&mut fs, b"/A/B/FILE", b"deep");

    fs.chdir(b"/A/B").unwrap();
    assert_eq!(fs.getcwd(), b"/A/B");
    assert_eq!(read_file(&mut fs, b"FILE"), b"deep");
    assert_eq!(read_file(&mut fs, b"./FILE"), b"deep");
    assert_eq!(read_file(&mut fs, b"../B/FILE"), b"deep");

    fs.chdir(b"..").unwrap();
    assert_eq!(fs.getcwd(), b"/A");
    fs.chdir(b"..").unwrap();
    assert_eq!(fs.getcwd(), b"/");
    assert!(matches!(
        fs.chdir(b"/A/B/FILE"),
        Err(Error::NotDirectory { .. })
    ));
}

#[test]
fn glob_matches_the_final_component() {
    let mut fs = fresh(1024);
    fs.mkdir(b"/BESLES-50001GAME").unwrap();
    fs.mkdir(b"/BESLES-50002GAME").unwrap();
    write_file(&mut fs, b"/README", b"x");

    let matches = fs.glob(b"/BESLES-*").unwrap();
    assert_eq!(
        matches,
        vec![b"/BESLES-50001GAME".to_vec(), b"/BESLES-50002GAME".to_vec()]
    );
    assert_eq!(fs.glob(b"/*").unwrap().len(), 3);
    assert_eq!(fs.glob(b"/BESLES-5000?GAME").unwrap().len(), 2);
    assert!(fs.glob(b"/NOSUCHDIR/*").unwrap().is_empty());

    fs.chdir(b"/BESLES-50001GAME").unwrap();
    assert!(fs.glob(b"*").unwrap().is_empty());
}

#[test]
fn dirent_metadata_round_trip() {
    let mut fs = fresh(1024);
    write_file(&mut fs, b"/FILE", b"x");
    let mut ent = fs.get_dirent(b"/FILE").unwrap();
    assert_eq!(ent.name(), b"FILE");
    assert!(ent.mode.is_file());

    ent.mode |= DirMode::HIDDEN;
    ent.mode &= !DirMode::WRITE;
    fs.set_dirent(b"/FILE", &ent).unwrap();

    let back = fs.get_dirent(b"/FILE").unwrap();
    assert!(back.mode.contains(DirMode::HIDDEN));
    assert!(!back.mode.contains(DirMode::WRITE));
    assert_eq!(back.length, 1);

    assert_eq!(fs.get_mode(b"/FILE").unwrap(), Some(back.mode));
    assert_eq!(fs.get_mode(b"/ABSENT").unwrap(), None);
}

#[test]
fn dir_size_counts_clusters() {
    let mut fs = fresh(1024);
    fs.mkdir(b"/SAVE").unwrap();
    write_file(&mut fs, b"/SAVE/A", &[0; 100]); // rounds up to one cluster
    write_file(&mut fs, b"/SAVE/B", &[0; 2500]); // three clusters
    // Four entry slots span two directory clusters, plus four file clusters.
    assert_eq!(fs.dir_size(b"/SAVE").unwrap(), 6 * 1024);
}

#[test]
fn filling_the_card_reports_no_space() {
    let mut fs = fresh(128);
    // 128 clusters: 2 + 1 + 1 reserved, 16 backup, 1 root => 107 free.
    let free = fs.get_free_space().unwrap();
    assert_eq!(free, 107 * 1024);

    let mut f = fs.open_file(b"/FILL", OpenMode::Write).unwrap();
    // One cluster came with the open; the write claims every other free one.
    let big = vec![0x5A; free as usize];
    f.write(&mut fs, &big).unwrap();
    assert!(matches!(f.write(&mut fs, &[0; 1024]), Err(Error::NoSpace)));
    f.close(&mut fs).unwrap();

    // The failed extension must not have leaked clusters.
    assert_eq!(fs.get_free_space().unwrap(), 0);
    assert!(fs.check().unwrap());
}

#[test]
fn ecc_corruption_is_corrected_on_read() {
    let fs = fresh(1024);
    let mut image = fs.into_inner().unwrap().into_inner();

    {
        let mut fs = McFs::open(Cursor::new(image), false).unwrap();
        write_file(&mut fs, b"/DATA", &[0x77; 512]);
        image = fs.into_inner().unwrap().into_inner();
    }

    // The file body landed in the first free cluster, relative 1: absolute
    // cluster 8 on this layout, page 16, raw offset 16 * (512 + 16).
    image[16 * 528 + 5] ^= 0x10;

    let mut fs = McFs::open(Cursor::new(image), false).unwrap();
    assert_eq!(read_file(&mut fs, b"/DATA"), vec![0x77; 512]);
    assert_eq!(fs.ecc_corrected(), 1);
    assert!(fs.check().unwrap());
}

#[test]
fn images_without_ecc_round_trip() {
    let params = FormatParams {
        with_ecc: false,
        ..FormatParams::with_clusters(1024)
    };
    let fs = McFs::format(Cursor::new(Vec::new()), &params).unwrap();
    let image = fs.into_inner().unwrap().into_inner();
    assert_eq!(image.len(), 2048 * 512);

    let mut fs = McFs::open(Cursor::new(image), false).unwrap();
    write_file(&mut fs, b"/DATA", b"no ecc here");
    assert_eq!(read_file(&mut fs, b"/DATA"), b"no ecc here");
    assert!(fs.check().unwrap());
}

#[test]
fn file_backed_images_work() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("card.ps2");
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&path)
        .unwrap();
    let mut fs = McFs::format(file, &FormatParams::with_clusters(1024)).unwrap();
    fs.mkdir(b"/SAVE").unwrap();
    let mut f = fs.open_file(b"/SAVE/FILE", OpenMode::Write).unwrap();
    f.write(&mut fs, b"on disk").unwrap();
    f.close(&mut fs).unwrap();
    fs.close().unwrap();

    // 2048 pages of 512 data + 16 spare bytes.
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 2048 * 528);

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    let mut fs = McFs::open(file, false).unwrap();
    let mut f = fs.open_file(b"/SAVE/FILE", OpenMode::Read).unwrap();
    assert_eq!(f.read_to_end(&mut fs).unwrap(), b"on disk");
    f.close(&mut fs).unwrap();
    assert!(fs.check().unwrap());
}

#[test]
fn reopened_images_persist_everything() {
    let mut fs = fresh(1024);
    fs.mkdir(b"/SAVE").unwrap();
    write_file(&mut fs, b"/SAVE/FILE", b"persistent");
    let image = fs.into_inner().unwrap();

    let mut fs = McFs::open(image, false).unwrap();
    assert_eq!(read_file(&mut fs, b"/SAVE/FILE"), b"persistent");
    let sb = fs.superblock();
    assert_eq!(sb.version_str(), b"1.2.0.0");
    assert_eq!(sb.page_size, 512);
    assert!(fs.check().unwrap());
}
