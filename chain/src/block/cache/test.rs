use super::BlockCache;

use herald_common::block::tree::{BlockTree, ChainView, Error, ImportResult};
use herald_common::bitcoin_hashes::Hash as _;
use herald_common::block::{BlockHash, BlockHeader, Height};
use herald_common::nonempty::NonEmpty;

use herald_test::assert_matches;
use herald_test::block::cache::model;
use herald_test::block::gen;

use quickcheck_macros::quickcheck;

/// A cache with an active chain of the given length on top of the regtest genesis.
fn cache(length: usize, rng: &mut fastrand::Rng) -> (BlockCache, NonEmpty<BlockHeader>) {
    let chain = gen::headers(gen::genesis(), length, rng);

    (BlockCache::from(chain.clone()), chain)
}

#[test]
fn test_extend_tip() {
    let mut rng = fastrand::Rng::with_seed(1);
    let (mut cache, chain) = cache(3, &mut rng);
    let (_, tip) = cache.tip();

    assert_eq!(cache.height(), 3);
    assert_eq!(tip, *chain.last());

    let header = gen::header(&tip, &mut rng);
    let result = cache.import_blocks(std::iter::once(header)).unwrap();

    assert_matches!(
        result,
        ImportResult::TipChanged { height: 4, ref reverted, ref connected, .. }
        if reverted.is_empty() && connected.len() == 1
    );
    assert_eq!(cache.tip(), (header.block_hash(), header));
}

#[test]
fn test_reorg_to_longer_branch() {
    let mut rng = fastrand::Rng::with_seed(2);
    let (mut cache, chain) = cache(5, &mut rng);
    let fork = gen::fork(&chain[2], 4, &mut rng);

    let result = cache.import_blocks(fork.iter().cloned()).unwrap();
    let (hash, header) = cache.tip();

    assert_eq!(header, *fork.last().unwrap());
    assert_eq!(cache.height(), 6);

    match result {
        ImportResult::TipChanged {
            hash: h,
            height,
            reverted,
            connected,
            ..
        } => {
            assert_eq!(h, hash);
            assert_eq!(height, 6);
            assert_eq!(
                reverted,
                vec![(5, chain[5]), (4, chain[4]), (3, chain[3])],
                "reverted blocks are listed highest first"
            );
            assert_eq!(
                connected.into_iter().collect::<Vec<_>>(),
                fork.iter()
                    .cloned()
                    .zip(3..)
                    .map(|(h, height)| (height, h))
                    .collect::<Vec<_>>()
            );
        }
        ImportResult::TipUnchanged => panic!("expected the tip to change"),
    }

    // Stale blocks stay known.
    for (height, header) in chain.iter().enumerate().skip(3) {
        let hash = header.block_hash();

        assert!(cache.is_known(&hash));
        assert!(!cache.is_on_active_chain(&hash));
        assert_eq!(cache.block_height(&hash), Some(height as Height));
    }
    assert_eq!(cache.stale_len(), 3);
}

#[test]
fn test_equal_work_branch_is_ignored() {
    let mut rng = fastrand::Rng::with_seed(3);
    let (mut cache, chain) = cache(4, &mut rng);
    let fork = gen::fork(&chain[2], 2, &mut rng);

    let result = cache.import_blocks(fork.iter().cloned()).unwrap();

    assert_eq!(result, ImportResult::TipUnchanged);
    assert_eq!(cache.tip().1, chain[4]);
    assert!(cache.is_known(&fork[1].block_hash()));

    // Extending the stale branch makes it the best chain.
    let next = gen::header(&fork[1], &mut rng);
    let result = cache.import_blocks(std::iter::once(next)).unwrap();

    assert_matches!(result, ImportResult::TipChanged { height: 5, .. });
    assert_eq!(cache.tip().1, next);
}

#[test]
fn test_missing_parent() {
    let mut rng = fastrand::Rng::with_seed(4);
    let (mut cache, chain) = cache(2, &mut rng);
    let orphans = gen::fork(&gen::header(&chain[2], &mut rng), 2, &mut rng);

    assert_matches!(
        cache.import_blocks(orphans.into_iter()),
        Err(Error::BlockMissing(_))
    );
    assert_eq!(cache.height(), 2);
}

#[test]
fn test_duplicate_import() {
    let mut rng = fastrand::Rng::with_seed(5);
    let (mut cache, chain) = cache(3, &mut rng);

    let result = cache.import_blocks(chain.tail.iter().cloned()).unwrap();

    assert_eq!(result, ImportResult::TipUnchanged);
    assert_eq!(cache.height(), 3);
    assert_eq!(cache.stale_len(), 0);
}

#[test]
fn test_ancestry_across_branches() {
    let mut rng = fastrand::Rng::with_seed(6);
    let (mut cache, chain) = cache(6, &mut rng);
    let stale = gen::fork(&chain[3], 2, &mut rng);

    cache.import_blocks(stale.iter().cloned()).unwrap();

    let stale_tip = stale[1].block_hash();
    let (active_tip, _) = cache.tip();

    assert_eq!(
        cache.fork_point(&stale_tip, &active_tip),
        chain[3].block_hash()
    );
    assert_eq!(
        cache.fork_point(&chain[1].block_hash(), &active_tip),
        chain[1].block_hash()
    );
    assert_eq!(
        cache.ancestors_since(&chain[3].block_hash(), &stale_tip),
        stale
    );
    assert_eq!(
        cache.ancestors_since(&chain[4].block_hash(), &active_tip),
        vec![chain[5], chain[6]]
    );
    assert!(cache
        .ancestors_since(&active_tip, &active_tip)
        .is_empty());

    assert!(cache.is_ancestor(&chain[2].block_hash(), &stale_tip));
    assert!(!cache.is_ancestor(&chain[4].block_hash(), &stale_tip));
    assert!(!cache.is_ancestor(&stale_tip, &active_tip));

    // The first locator hash that is an ancestor of the tip wins.
    let locator = vec![stale_tip, chain[5].block_hash(), chain[1].block_hash()];
    assert_eq!(
        cache.common_ancestor(&locator, &active_tip),
        chain[5].block_hash()
    );
    assert_eq!(cache.common_ancestor(&[stale_tip], &active_tip), chain[0].block_hash());
}

#[test]
#[should_panic]
fn test_ancestors_since_requires_ancestor() {
    let mut rng = fastrand::Rng::with_seed(7);
    let (mut cache, chain) = cache(4, &mut rng);
    let stale = gen::fork(&chain[1], 1, &mut rng);

    cache.import_blocks(stale.iter().cloned()).unwrap();
    cache.ancestors_since(&stale[0].block_hash(), &chain[4].block_hash());
}

#[test]
fn test_locate_headers() {
    let mut rng = fastrand::Rng::with_seed(8);
    let (cache, chain) = cache(10, &mut rng);
    let zero = BlockHash::all_zeros();

    // Everything after the locator.
    let headers = cache.locate_headers(&[chain[4].block_hash()], zero, 2000);
    assert_eq!(headers, chain.tail[4..].to_vec());

    // Up to and including the stop hash.
    let headers = cache.locate_headers(&[chain[4].block_hash()], chain[7].block_hash(), 2000);
    assert_eq!(headers, vec![chain[5], chain[6], chain[7]]);

    // Limited by the maximum.
    let headers = cache.locate_headers(&[chain[0].block_hash()], zero, 3);
    assert_eq!(headers, vec![chain[1], chain[2], chain[3]]);

    // Nothing after the tip.
    let headers = cache.locate_headers(&[chain[10].block_hash()], zero, 2000);
    assert!(headers.is_empty());

    // No locators: only the stop hash.
    let headers = cache.locate_headers(&[], chain[3].block_hash(), 2000);
    assert_eq!(headers, vec![chain[3]]);
}

#[test]
fn test_locator_hashes() {
    let mut rng = fastrand::Rng::with_seed(9);
    let (cache, chain) = cache(12, &mut rng);
    let hashes = cache.locator_hashes(cache.height());

    assert_eq!(hashes.first(), Some(&chain[12].block_hash()));
    assert_eq!(hashes.last(), Some(&chain[0].block_hash()));
    assert_eq!(
        hashes.len(),
        herald_common::block::locators_indexes(12).len()
    );
}

#[quickcheck]
fn prop_cache_matches_model(seed: u64) -> bool {
    let mut rng = fastrand::Rng::with_seed(seed);
    let genesis = gen::genesis();
    let mut cache = BlockCache::new(genesis);
    let mut model = model::Cache::new(genesis);
    let mut known = vec![genesis];

    for _ in 0..rng.usize(1..8) {
        let parent = known[rng.usize(..known.len())];
        let branch = gen::fork(&parent, rng.usize(1..6), &mut rng);

        let expected = model.import_blocks(branch.iter().cloned()).unwrap();
        let actual = cache.import_blocks(branch.iter().cloned()).unwrap();

        if expected != actual || model.tip() != cache.tip() {
            return false;
        }
        known.extend(branch);
    }
    known.iter().all(|h| {
        let hash = h.block_hash();

        cache.block_height(&hash) == model.block_height(&hash)
            && cache.is_on_active_chain(&hash) == model.is_on_active_chain(&hash)
    })
}
