mod coalescing;
mod expiry;
