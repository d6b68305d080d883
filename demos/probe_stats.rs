use clap::Parser;
use probemap::HashTable;
use probemap::hash::hash_bytes;
use probemap::hash_table::Entry;

#[derive(Parser, Debug)]
struct Args {
    #[arg(short = 'c', long = "target_capacity", default_value_t = 1000)]
    target_capacity: usize,
}

fn hash_u64(value: u64) -> u64 {
    hash_bytes(&value.to_le_bytes(), 0)
}

fn main() {
    let args = Args::parse();

    println!(
        "Creating HashTable with target capacity: {}",
        args.target_capacity
    );

    let mut table: HashTable<u64> = HashTable::with_capacity(args.target_capacity);

    println!("Actual capacity: {}", table.capacity());
    println!("Filling table to its load bound with u64 values...");

    let num_values = table.capacity() / 8 * 7;
    for i in 0..num_values {
        let value = i as u64;
        let hash = hash_u64(value);

        match table.entry(hash, |&v| v == value, |&v| hash_u64(v)) {
            Entry::Vacant(entry) => {
                entry.insert(value);
            }
            Entry::Occupied(_) => {
                panic!("value already exists in table: {}", value);
            }
        }
    }

    println!("Inserted {} values into table", table.len());
    println!(
        "Final load factor: {:.2}%",
        (table.len() as f64 / table.capacity() as f64) * 100.0
    );

    // Tombstone a slice of the keys to show their effect on the stats.
    for i in (0..num_values as u64).step_by(5) {
        let _ = table.remove(hash_u64(i), |&v| v == i);
    }
    println!("Erased every fifth value ({} remain)", table.len());

    table.probe_histogram(|&v| hash_u64(v)).print();
    table.debug_stats().print();
}
