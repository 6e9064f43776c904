use xipher_vault::{VaultMasterKey, VaultRecord, VaultScheme};

fn make_secret(size: usize) -> Vec<u8> {
    (0..size).map(|i| b'A' + (i % 26) as u8).collect()
}

#[divan::bench(args = [64, 1024])]
fn bench_seal_legacy(bencher: divan::Bencher, size: usize) {
    let secret = make_secret(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| VaultScheme::Legacy.seal(divan::black_box(&secret)).unwrap());
}

#[divan::bench(args = [64, 1024])]
fn bench_seal_sealed(bencher: divan::Bencher, size: usize) {
    let scheme = VaultScheme::Sealed(VaultMasterKey::from_bytes([0x5Au8; 32]));
    let secret = make_secret(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| scheme.seal(divan::black_box(&secret)).unwrap());
}

#[divan::bench(args = [64, 1024])]
fn bench_open_legacy(bencher: divan::Bencher, size: usize) {
    let blob = VaultScheme::Legacy.seal(&make_secret(size)).unwrap().encode();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            let record = VaultRecord::decode(divan::black_box(&blob)).unwrap();
            VaultScheme::Legacy.open(&record).unwrap()
        });
}

fn main() {
    divan::main();
}
