use gbde_crypto::{Aes128Ctr, SectorCrypter, MKEY_LEN, SALT_LEN, SKEY_LEN};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [512, 4096])]
fn bench_encrypt_sector(bencher: divan::Bencher, size: usize) {
    let mkey = [0x42u8; MKEY_LEN];
    let salt = [0x17u8; SALT_LEN];
    let crypter = SectorCrypter::new(&mkey, &salt, &Aes128Ctr);
    let data = make_data(size);
    let mut out = vec![0u8; size];
    let mut slot = [0u8; SKEY_LEN];
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench_local(|| {
            crypter
                .encrypt(
                    divan::black_box(8192),
                    &mut slot,
                    divan::black_box(&data),
                    &mut out,
                )
                .unwrap()
        });
}

#[divan::bench(args = [512, 4096])]
fn bench_decrypt_sector(bencher: divan::Bencher, size: usize) {
    let mkey = [0x42u8; MKEY_LEN];
    let salt = [0x17u8; SALT_LEN];
    let crypter = SectorCrypter::new(&mkey, &salt, &Aes128Ctr);
    let data = make_data(size);
    let mut disk = vec![0u8; size];
    let mut slot = [0u8; SKEY_LEN];
    crypter.encrypt(8192, &mut slot, &data, &mut disk).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench_local(|| {
            let mut buf = disk.clone();
            crypter
                .decrypt(divan::black_box(8192), &slot, &mut buf)
                .unwrap();
            buf
        });
}

fn main() {
    divan::main();
}
