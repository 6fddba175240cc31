use camino::Utf8Path;

use gamelib_pipeline::domain::{LinkEntry, LinkType};
use gamelib_pipeline::store::{Workspace, entry_slug, sanitize_component};

#[test]
fn layout_paths() {
    let workspace = Workspace::under(Utf8Path::new("/library"));
    let halo = LinkEntry::new("Halo 3", "https://example.org/iso/Halo%203.tar.gz", LinkType::Iso);
    let braid = LinkEntry::new("Braid", "https://example.org/xbla/Braid.zip", LinkType::Xbla);

    let paths = workspace.working_paths(&halo);
    assert_eq!(paths.download, "/library/downloads/ISO-Halo 3.tar.gz");
    assert_eq!(paths.extract, "/library/temp/ISO-Halo 3");
    assert_eq!(paths.convert, "/library/temp/ISO-Halo 3.god");

    assert_eq!(
        workspace.placement_dir(&halo, true),
        "/library/output/god_converted/Halo 3"
    );
    assert_eq!(workspace.placement_dir(&halo, false), "/library/output/ISO/Halo 3");
    assert_eq!(workspace.placement_dir(&braid, false), "/library/output/XBLA/Braid");
}

#[test]
fn names_are_made_path_safe() {
    assert_eq!(sanitize_component("Halo: Reach?"), "Halo_ Reach_");
    assert_eq!(sanitize_component("../.."), ".._");
    assert_eq!(sanitize_component(".."), "_");
    let entry = LinkEntry::new("Beyond/Good", "https://example.org/b.zip", LinkType::Xbla);
    assert_eq!(entry_slug(&entry), "XBLA-Beyond_Good");
}
